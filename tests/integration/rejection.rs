use crate::*;

use drift_core::{Feed, Keypair};
use drift_kernel::KernelError;
use drift_store::BlockBody;

/// A locally created block the reducer refuses raises loudly and
/// leaves both the state and the own feed untouched.
#[tokio::test]
async fn refused_local_block_raises() -> Result<()> {
    let a = node().await?;
    a.create_block(COLLECTION, json!(2), None).await?;

    let err = a.create_block(COLLECTION, json!(1), None).await.unwrap_err();
    assert!(matches!(err, KernelError::Rejected(_)));

    let pk = a.pk()?;
    assert_eq!(counter_of(&a, &pk), 2);
    assert_eq!(a.feed()?.expect("own feed").len(), 1);
    Ok(())
}

/// Feeds arriving from the network merge quietly: a refused remote
/// block is dropped without an error and without touching state.
#[tokio::test]
async fn refused_remote_block_is_dropped_quietly() -> Result<()> {
    let a = node().await?;
    let b = node().await?;
    connect(&a, &b)?;
    a.create_block(COLLECTION, json!(5), None).await?;
    let pk_a = a.pk()?;
    settled("peer converged", || counter_of(&b, &pk_a) == 5).await;

    // A foreign author whose blocks never increment.
    let rogue = Keypair::generate();
    let mut feed = Feed::new();
    let body = BlockBody {
        kind: COLLECTION.into(),
        seq: 0,
        date: 0,
        payload: json!(0),
    };
    feed.append(body.to_bytes()?, &rogue);

    let mutation = b.dispatch(&feed, false).await?;
    assert!(mutation.is_empty());
    assert_eq!(counter_of(&b, &rogue.public), 0);

    // Nothing refused ever reaches the other node.
    sleep(Duration::from_millis(100)).await;
    assert_eq!(counter_of(&a, &rogue.public), 0);
    Ok(())
}

/// Rejections on one author leave convergence of the others intact.
#[tokio::test]
async fn rejection_does_not_block_convergence() -> Result<()> {
    let a = node().await?;
    let b = node().await?;
    connect(&a, &b)?;

    a.create_block(COLLECTION, json!(2), None).await?;
    assert!(a.create_block(COLLECTION, json!(1), None).await.is_err());
    b.create_block(COLLECTION, json!(9), None).await?;

    let pk_a = a.pk()?;
    let pk_b = b.pk()?;
    settled("both converge past the rejection", || {
        counter_of(&b, &pk_a) == 2 && counter_of(&a, &pk_b) == 9
    })
    .await;
    Ok(())
}
