use log::debug;

use crate::Communicator;

/// Runs `f` on the local master first and on every other process afterwards.
///
/// Used around work with side effects every process would otherwise race on, such as
/// caching a dataset to disk: the master does it while its peers wait at a barrier, then
/// they run `f` and find the work already done.
///
/// # Arguments
/// * `comm` - The distributed context of this process.
/// * `f` - The work to run.
///
/// # Returns
/// Whatever `f` returns.
pub async fn wait_for_the_master<C, F, T>(comm: &C, f: F) -> T
where
    C: Communicator,
    F: FnOnce() -> T + Send,
{
    if comm.world_size() == 1 {
        return f();
    }

    let is_master = comm.local_rank() == 0;
    if !is_master {
        debug!("rank {} waiting for the local master", comm.rank());
        comm.barrier().await;
    }

    let out = f();

    if is_master {
        comm.barrier().await;
    }

    out
}

#[cfg(test)]
mod tests {
    use std::{
        num::NonZeroUsize,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use super::*;
    use crate::LocalGroup;

    #[tokio::test]
    async fn master_runs_before_everyone_else() {
        let order = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = LocalGroup::create(NonZeroUsize::new(4).unwrap())
            .into_iter()
            .map(|member| {
                let order = order.clone();
                tokio::spawn(async move {
                    let turn =
                        wait_for_the_master(&member, || order.fetch_add(1, Ordering::SeqCst))
                            .await;
                    (member.rank(), turn)
                })
            })
            .collect();

        for handle in handles {
            let (rank, turn) = handle.await.unwrap();
            if rank == 0 {
                assert_eq!(turn, 0);
            } else {
                assert!(turn > 0);
            }
        }
    }
}
