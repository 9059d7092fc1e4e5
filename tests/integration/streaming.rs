use crate::*;

/// A hub tracking several authors answers a query with one feed per
/// head, streamed frame by frame; the newcomer ends up with all of
/// them.
#[tokio::test]
async fn query_streams_every_head() -> Result<()> {
    let hub = node().await?;
    let mut authors = Vec::new();

    // Three peers each publish, converge into the hub, then leave.
    for n in 1..=3 {
        let peer = node().await?;
        let wire = connect(&hub, &peer)?;
        peer.create_block(COLLECTION, json!(n), None).await?;
        let pk = peer.pk()?;
        settled("hub absorbs the peer's block", || counter_of(&hub, &pk) == n).await;
        wire.close();
        settled("peer gone", || connection_count(&hub) == 0).await;
        authors.push((pk, n));
    }

    // The newcomer's initial sync pulls one feed per known head,
    // the hub's own (empty history) aside.
    let newcomer = node().await?;
    connect(&hub, &newcomer)?;
    settled("newcomer holds every departed author", || {
        authors
            .iter()
            .all(|(pk, n)| counter_of(&newcomer, pk) == *n)
    })
    .await;
    Ok(())
}

/// Two empty nodes exchange bare acknowledgements on sync; state stays
/// empty and the wire keeps working afterwards.
#[tokio::test]
async fn empty_sync_is_harmless() -> Result<()> {
    let a = node().await?;
    let b = node().await?;
    connect(&a, &b)?;
    settled("handshake", || connection_count(&a) == 1).await;

    sleep(Duration::from_millis(100)).await;
    assert_eq!(a.state_of(COLLECTION), Some(json!({})));
    assert_eq!(b.state_of(COLLECTION), Some(json!({})));

    a.create_block(COLLECTION, json!(1), None).await?;
    let pk_a = a.pk()?;
    settled("wire still carries blocks", || counter_of(&b, &pk_a) == 1).await;
    Ok(())
}
