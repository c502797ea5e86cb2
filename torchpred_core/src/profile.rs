//! Draining the native profiler after a run

use crate::error::{PredictorResult, TraceError};
use crate::native::{self, NativeApi, PredictorHandle};
use std::ffi::CStr;

/// Profiler output of one run
#[derive(Debug, Clone, PartialEq)]
pub struct RawProfile {
    /// JSON event array
    pub json: String,
    /// Absolute profiler epoch in nanoseconds
    pub start_ns: i64,
}

/// Read the profile buffer and the profiler epoch of the last run.
///
/// The buffer is read first; the engine settles the epoch while draining the
/// profiler. The buffer is released exactly once, whatever happens.
///
/// # Safety
///
/// `pred` must be a live predictor handle produced by `api`.
pub unsafe fn read_profile(api: &dyn NativeApi, pred: PredictorHandle) -> PredictorResult<RawProfile> {
    let buffer = api.profiling_read(pred);
    let status = native::check(api, "profiling_read");

    if buffer.is_null() {
        status?;
        return Err(TraceError::Unavailable.into());
    }

    let text = CStr::from_ptr(buffer).to_str().map(str::to_owned);
    api.free_profile(buffer);
    if let Err(e) = native::check(api, "free_profile") {
        log::warn!("failed to release profile buffer: {}", e);
    }
    status?;
    let json = text.map_err(|_| TraceError::InvalidUtf8)?;

    let start_ns = api.profiling_start_time(pred);
    native::check(api, "profiling_start_time")?;

    log::debug!("read {} byte profile starting at {} ns", json.len(), start_ns);
    Ok(RawProfile { json, start_ns })
}

/// Read and throw away whatever the profiler recorded, logging failures
///
/// # Safety
///
/// `pred` must be a live predictor handle produced by `api`.
pub unsafe fn discard_profile(api: &dyn NativeApi, pred: PredictorHandle) {
    match read_profile(api, pred) {
        Ok(profile) => log::debug!("discarded {} byte profile of a failed run", profile.json.len()),
        Err(e) => log::debug!("no profile to discard after a failed run: {}", e),
    }
}
