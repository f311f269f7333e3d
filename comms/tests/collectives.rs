use std::num::NonZeroUsize;

use comms::{Communicator, LocalGroup, wait_for_the_master};
use futures::future::join_all;

#[tokio::test]
async fn ranks_agree_after_master_setup_and_broadcast() {
    let members = LocalGroup::create(NonZeroUsize::new(3).unwrap());

    let runs = members.into_iter().map(|member| async move {
        let local = wait_for_the_master(&member, || member.rank() * 10).await;

        let mut shape = if member.rank() == 0 { [480, 608] } else { [0, 0] };
        member.barrier().await;
        member.broadcast(&mut shape, 0).await.unwrap();

        (local, shape)
    });

    let results = join_all(runs).await;
    assert_eq!(results.len(), 3);

    for (rank, (local, shape)) in results.into_iter().enumerate() {
        assert_eq!(local, rank * 10);
        assert_eq!(shape, [480, 608]);
    }
}
