use crate::*;

/// The reactive connection set follows the wire lifecycle on both
/// sides: empty, one resolved peer, empty again after close.
#[tokio::test]
async fn connection_set_tracks_wire_lifecycle() -> Result<()> {
    let a = node().await?;
    let b = node().await?;
    assert_eq!(connection_count(&a), 0);
    assert_eq!(connection_count(&b), 0);

    let wire = connect(&a, &b)?;
    settled("both sides resolve the peer", || {
        let seen = |k: &Kernel| {
            let conns = k.connections();
            let conns = conns.borrow();
            conns.len() == 1 && conns[0].peer.is_some()
        };
        seen(&a) && seen(&b)
    })
    .await;

    wire.close();
    settled("both sides observe the disconnect", || {
        connection_count(&a) == 0 && connection_count(&b) == 0
    })
    .await;
    Ok(())
}

/// A second wire between the same two nodes is refused during
/// handshake; the original connection survives.
#[tokio::test]
async fn redundant_wires_collapse_to_one() -> Result<()> {
    let a = node().await?;
    let b = node().await?;

    connect(&a, &b)?;
    settled("first wire resolves", || {
        connection_count(&a) == 1 && connection_count(&b) == 1
    })
    .await;

    connect(&a, &b)?;
    connect(&a, &b)?;
    // Give the duplicates time to be refused and torn down.
    sleep(Duration::from_millis(100)).await;
    assert_eq!(connection_count(&a), 1);
    assert_eq!(connection_count(&b), 1);

    // The surviving wire still carries blocks.
    a.create_block(COLLECTION, json!(1), None).await?;
    let pk_a = a.pk()?;
    settled("block crosses the surviving wire", || {
        counter_of(&b, &pk_a) == 1
    })
    .await;
    Ok(())
}

/// Closing a kernel tears down all of its wires.
#[tokio::test]
async fn close_disconnects_every_peer() -> Result<()> {
    let hub = node().await?;
    let a = node().await?;
    let b = node().await?;
    connect(&hub, &a)?;
    connect(&hub, &b)?;
    settled("hub sees two peers", || connection_count(&hub) == 2).await;

    hub.close();
    settled("every side observes the teardown", || {
        connection_count(&hub) == 0 && connection_count(&a) == 0 && connection_count(&b) == 0
    })
    .await;
    Ok(())
}
