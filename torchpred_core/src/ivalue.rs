//! Decoding and freeing of the engine's polymorphic result values
//!
//! Ownership is split: tuple scaffolding (tuple nodes and their child arrays)
//! is released by [`free`], tensor leaves are released by [`decode`] right
//! after their payload has been copied. Neither path touches the other's
//! allocations.

use crate::error::{PredictorError, PredictorResult, ResultError};
use crate::native::{self, NativeApi, RawIValue, RawIValueTuple, TensorHandle, IVALUE_TENSOR, IVALUE_TUPLE};
use crate::tensor::{self, Tensor};
use std::ffi::c_int;

/// A result node viewed through its tag
#[derive(Debug)]
pub enum IValueNode<'a> {
    Tensor(TensorHandle),
    Tuple {
        tuple: *mut RawIValueTuple,
        children: &'a [RawIValue],
    },
    /// Neither tensor nor tuple
    Other(c_int),
}

impl RawIValue {
    /// View this value as a node.
    ///
    /// # Safety
    ///
    /// The value must come from the engine (or mirror its layout) and its
    /// scaffolding must not have been freed.
    pub unsafe fn node(&self) -> Result<IValueNode<'_>, ResultError> {
        match self.itype {
            IVALUE_TENSOR => {
                if self.data_ptr.is_null() {
                    return Err(ResultError::MalformedTree("null tensor leaf".to_string()));
                }
                Ok(IValueNode::Tensor(self.data_ptr))
            }
            IVALUE_TUPLE => {
                let tuple = self.data_ptr as *mut RawIValueTuple;
                if tuple.is_null() {
                    return Err(ResultError::MalformedTree("null tuple".to_string()));
                }
                let (values, length) = ((*tuple).values, (*tuple).length);
                let children: &[RawIValue] = match length {
                    0 => &[],
                    n if n < 0 || values.is_null() => {
                        return Err(ResultError::MalformedTree(format!("tuple of length {}", n)))
                    }
                    n => std::slice::from_raw_parts(values, n as usize),
                };
                Ok(IValueNode::Tuple { tuple, children })
            }
            other => Ok(IValueNode::Other(other)),
        }
    }

    pub fn is_untyped(&self) -> bool {
        self.itype != IVALUE_TENSOR && self.itype != IVALUE_TUPLE
    }
}

/// Collect tensor leaves left-to-right, pre-order.
///
/// Malformed subtrees are skipped; the first one is recorded in `malformed`
/// and the walk goes on so every reachable leaf is still collected.
///
/// # Panics
///
/// Panics on a node that is neither tensor nor tuple.
unsafe fn collect_leaves(value: &RawIValue, leaves: &mut Vec<TensorHandle>, malformed: &mut Option<ResultError>) {
    match value.node() {
        Ok(IValueNode::Tensor(handle)) => leaves.push(handle),
        Ok(IValueNode::Tuple { children, .. }) => {
            for child in children {
                collect_leaves(child, leaves, malformed);
            }
        }
        Ok(IValueNode::Other(tag)) => panic!("expecting a tensor or tuple value, got tag {}", tag),
        Err(e) => {
            malformed.get_or_insert(e);
        }
    }
}

/// Flatten a result tree into its tensors, releasing every tensor leaf.
///
/// Every reachable leaf is released exactly once, even if copying one of
/// them fails. A malformed tree releases its reachable leaves without
/// copying any and fails with [`ResultError::MalformedTree`].
///
/// # Safety
///
/// `value` must be a live result tree produced by `api`, and its leaves must
/// not have been released yet.
pub unsafe fn decode(api: &dyn NativeApi, value: &RawIValue) -> PredictorResult<Vec<Tensor>> {
    let mut leaves = Vec::new();
    let mut malformed = None;
    collect_leaves(value, &mut leaves, &mut malformed);

    let mut tensors = Vec::with_capacity(leaves.len());
    let mut failure: Option<PredictorError> = malformed.map(PredictorError::from);
    for handle in leaves {
        if failure.is_none() {
            match tensor::decode(api, handle) {
                Ok(t) => tensors.push(t),
                Err(e) => failure = Some(e),
            }
        }
        api.delete_tensor(handle);
        if let Err(e) = native::check(api, "delete_tensor") {
            failure.get_or_insert(e.into());
        }
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(tensors),
    }
}

/// Release the tuple scaffolding of a result tree.
///
/// Children are freed before the child array, the child array before the
/// tuple node. Tensor leaves are left alone.
///
/// # Safety
///
/// `value` must be a result tree produced by `api` whose scaffolding has not
/// been freed yet.
pub unsafe fn free(api: &dyn NativeApi, value: &RawIValue) {
    let (tuple, children) = match value.node() {
        Ok(IValueNode::Tuple { tuple, children }) => (tuple, children),
        Ok(IValueNode::Tensor(_)) | Ok(IValueNode::Other(_)) => return,
        Err(e) => {
            log::warn!("leaking malformed result scaffolding: {}", e);
            return;
        }
    };

    for child in children {
        free(api, child);
    }
    api.free_tuple_values((*tuple).values, children.len());
    api.free_tuple(tuple);
}

/// Result tree whose scaffolding is freed when dropped
pub struct OwnedIValue<'a> {
    api: &'a dyn NativeApi,
    raw: RawIValue,
}

impl<'a> OwnedIValue<'a> {
    /// # Safety
    ///
    /// `raw` must be a fresh result tree produced by `api`, owned by nobody else.
    pub unsafe fn new(api: &'a dyn NativeApi, raw: RawIValue) -> Self {
        Self { api, raw }
    }

    pub fn is_untyped(&self) -> bool {
        self.raw.is_untyped()
    }

    /// Decode the tree, releasing its tensor leaves. The scaffolding is
    /// freed when `self` drops at the end of the call.
    ///
    /// Leaves can only be released once, so decoding consumes the value:
    ///
    /// ```compile_fail
    /// use torchpred_core::ivalue::OwnedIValue;
    /// use torchpred_core::native::{SimRuntime, SimValue};
    ///
    /// let sim = SimRuntime::new();
    /// let owned = unsafe { OwnedIValue::new(&sim, sim.alloc_value(SimValue::Tuple(vec![]))) };
    /// let _ = owned.decode();
    /// let _ = owned.decode();
    /// ```
    pub fn decode(self) -> PredictorResult<Vec<Tensor>> {
        unsafe { decode(self.api, &self.raw) }
    }
}

impl Drop for OwnedIValue<'_> {
    fn drop(&mut self) {
        unsafe { free(self.api, &self.raw) };
        if let Err(e) = native::check(self.api, "free_ivalue") {
            log::warn!("failed to release result value: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::{NativeDType, SimRuntime, SimTensor, SimValue, IVALUE_UNKNOWN};

    fn leaf(v: i32) -> SimValue {
        SimValue::Tensor(SimTensor {
            dtype: NativeDType::Int,
            shape: vec![1],
            bytes: v.to_ne_bytes().to_vec(),
        })
    }

    fn values(tensors: &[Tensor]) -> Vec<i32> {
        tensors.iter().map(|t| t.array::<i32>().unwrap().iter().copied().next().unwrap()).collect()
    }

    /// Tree of the given depth; `width` children per tuple, every other child a subtree
    fn tree(depth: usize, width: usize, next: &mut i32) -> SimValue {
        if depth == 0 {
            *next += 1;
            return leaf(*next);
        }
        SimValue::Tuple(
            (0..width)
                .map(|i| {
                    if i % 2 == 0 {
                        tree(depth - 1, (width + i) % 4, next)
                    } else {
                        *next += 1;
                        leaf(*next)
                    }
                })
                .collect(),
        )
    }

    #[test]
    fn test_decode_bare_tensor() {
        let sim = SimRuntime::new();
        let raw = sim.alloc_value(leaf(7));
        let tensors = unsafe { decode(&sim, &raw) }.unwrap();
        assert_eq!(values(&tensors), vec![7]);
        unsafe { free(&sim, &raw) };
        assert_eq!(sim.live_allocations(), 0);
    }

    #[test]
    fn test_decode_nested_tuple_in_pre_order() {
        let sim = SimRuntime::new();
        let raw = sim.alloc_value(SimValue::Tuple(vec![
            leaf(1),
            SimValue::Tuple(vec![leaf(2), leaf(3)]),
        ]));
        let owned = unsafe { OwnedIValue::new(&sim, raw) };
        assert_eq!(values(&owned.decode().unwrap()), vec![1, 2, 3]);

        let stats = sim.stats();
        assert_eq!(stats.tuples_freed, 2);
        assert_eq!(stats.tuple_values_freed, 2);
        assert_eq!(stats.tensors_released, 3);
        assert_eq!(stats.invalid_frees, 0);
        assert_eq!(sim.live_allocations(), 0);
    }

    #[test]
    fn test_free_never_releases_tensor_leaves() {
        for depth in 0..6 {
            for width in 0..5 {
                let sim = SimRuntime::new();
                let mut next = 0;
                let raw = sim.alloc_value(tree(depth, width, &mut next));

                let mut leaves = Vec::new();
                let mut malformed = None;
                unsafe { collect_leaves(&raw, &mut leaves, &mut malformed) };
                assert!(malformed.is_none());
                let allocated = sim.stats();

                unsafe { free(&sim, &raw) };
                let stats = sim.stats();
                assert_eq!(stats.tuples_freed, allocated.tuples_allocated, "depth {} width {}", depth, width);
                assert_eq!(stats.tuple_values_freed, allocated.tuples_allocated);
                assert_eq!(stats.tensors_released, 0);
                assert_eq!(stats.invalid_frees, 0);
                assert_eq!(sim.live_allocations(), leaves.len());

                for handle in leaves {
                    unsafe { sim.delete_tensor(handle) };
                }
                assert_eq!(sim.live_allocations(), 0);
                assert_eq!(sim.stats().invalid_frees, 0);
            }
        }
    }

    #[test]
    fn test_decode_and_free_release_everything_once() {
        for depth in 0..5 {
            let sim = SimRuntime::new();
            let mut next = 0;
            let raw = sim.alloc_value(tree(depth, 3, &mut next));
            let tensors = unsafe { OwnedIValue::new(&sim, raw) }.decode().unwrap();
            assert_eq!(tensors.len() as i32, next);
            assert_eq!(values(&tensors), (1..=next).collect::<Vec<_>>());
            assert_eq!(sim.live_allocations(), 0);
            assert_eq!(sim.stats().invalid_frees, 0);
        }
    }

    #[test]
    fn test_empty_tuple() {
        let sim = SimRuntime::new();
        let raw = sim.alloc_value(SimValue::Tuple(vec![SimValue::Tuple(vec![])]));
        let owned = unsafe { OwnedIValue::new(&sim, raw) };
        assert!(owned.decode().unwrap().is_empty());
        assert_eq!(sim.stats().tuples_freed, 2);
        assert_eq!(sim.live_allocations(), 0);
    }

    #[test]
    fn test_negative_tuple_length_is_malformed() {
        let sim = SimRuntime::new();
        let tuple = Box::into_raw(Box::new(RawIValueTuple {
            values: std::ptr::null_mut(),
            length: -1,
        }));
        let raw = RawIValue {
            itype: IVALUE_TUPLE,
            data_ptr: tuple as *mut std::ffi::c_void,
        };
        let err = unsafe { decode(&sim, &raw) }.unwrap_err();
        assert!(matches!(err, PredictorError::Result(ResultError::MalformedTree(_))));
        drop(unsafe { Box::from_raw(tuple) });
    }

    #[test]
    fn test_owned_decode_releases_each_leaf_once() {
        let sim = SimRuntime::new();
        let raw = sim.alloc_value(SimValue::Tuple(vec![leaf(4), SimValue::Tuple(vec![leaf(5)])]));
        let tensors = unsafe { OwnedIValue::new(&sim, raw) }.decode().unwrap();
        assert_eq!(values(&tensors), vec![4, 5]);

        let stats = sim.stats();
        assert_eq!(stats.tensors_released, 2);
        assert_eq!(stats.tuples_freed, 2);
        assert_eq!(stats.invalid_frees, 0);
        assert_eq!(sim.live_allocations(), 0);
    }

    #[test]
    fn test_malformed_subtree_still_releases_reachable_leaves() {
        let sim = SimRuntime::new();
        let broken = Box::into_raw(Box::new(RawIValueTuple {
            values: std::ptr::null_mut(),
            length: -1,
        }));
        let children = vec![
            sim.alloc_value(leaf(1)),
            RawIValue {
                itype: IVALUE_TUPLE,
                data_ptr: broken as *mut std::ffi::c_void,
            },
            sim.alloc_value(leaf(2)),
        ];
        let values_ptr = Box::into_raw(children.into_boxed_slice()) as *mut RawIValue;
        let outer = Box::into_raw(Box::new(RawIValueTuple {
            values: values_ptr,
            length: 3,
        }));
        let raw = RawIValue {
            itype: IVALUE_TUPLE,
            data_ptr: outer as *mut std::ffi::c_void,
        };

        let err = unsafe { decode(&sim, &raw) }.unwrap_err();
        assert!(matches!(err, PredictorError::Result(ResultError::MalformedTree(_))));
        let stats = sim.stats();
        assert_eq!(stats.tensors_released, 2);
        assert_eq!(stats.invalid_frees, 0);
        assert_eq!(sim.live_allocations(), 0);

        unsafe {
            drop(Box::from_raw(outer));
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(values_ptr, 3)));
            drop(Box::from_raw(broken));
        }
    }

    #[test]
    #[should_panic(expected = "expecting a tensor or tuple")]
    fn test_untyped_child_is_fatal() {
        let sim = SimRuntime::new();
        let raw = sim.alloc_value(SimValue::Tuple(vec![leaf(1), SimValue::Unknown]));
        let _ = unsafe { decode(&sim, &raw) };
    }

    #[test]
    fn test_untyped_root() {
        let raw = RawIValue::unknown();
        assert!(raw.is_untyped());
        assert_eq!(raw.itype, IVALUE_UNKNOWN);
    }
}
