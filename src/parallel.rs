//! Batch-level data parallelism.
//!
//! Kernels only ever parallelise over samples: [`for_each_mut`] is the batch
//! loop every kernel and the padding transform go through. With
//! `parallelize == false` it runs sequentially in index order, which keeps
//! results bit-for-bit reproducible.

use rayon::prelude::*;

/// Calls `f(i, &mut items[i])` for every item.
///
/// Each worker gets exclusive access to its own item, so no synchronisation is
/// needed inside `f`.
pub fn for_each_mut<T, F>(parallelize: bool, items: &mut [T], f: F)
where
    T: Send,
    F: Fn(usize, &mut T) + Sync + Send,
{
    if parallelize && items.len() > 1 {
        items.par_iter_mut().enumerate().for_each(|(i, item)| f(i, item));
    } else {
        items.iter_mut().enumerate().for_each(|(i, item)| f(i, item));
    }
}
