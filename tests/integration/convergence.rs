use crate::*;

/// Blocks created on either side of a single wire reach the other.
#[tokio::test]
async fn two_nodes_converge() -> Result<()> {
    let a = node().await?;
    let b = node().await?;
    connect(&a, &b)?;
    settled("handshake", || connection_count(&a) == 1).await;

    a.create_block(COLLECTION, json!(1), None).await?;
    b.create_block(COLLECTION, json!(3), None).await?;
    a.create_block(COLLECTION, json!(2), None).await?;

    let pk_a = a.pk()?;
    let pk_b = b.pk()?;
    settled("both hold both authors' latest", || {
        counter_of(&a, &pk_b) == 3
            && counter_of(&b, &pk_a) == 2
            && counter_of(&a, &pk_a) == 2
            && counter_of(&b, &pk_b) == 3
    })
    .await;
    Ok(())
}

/// Blocks created before any wire exists arrive through the initial
/// sync that runs when a connection comes up.
#[tokio::test]
async fn initial_sync_pulls_existing_blocks() -> Result<()> {
    let a = node().await?;
    let b = node().await?;
    for n in 1..=3 {
        a.create_block(COLLECTION, json!(n), None).await?;
    }

    connect(&a, &b)?;
    let pk_a = a.pk()?;
    settled("late peer catches up", || counter_of(&b, &pk_a) == 3).await;
    Ok(())
}

/// A line of nodes floods every block to every node: each relay
/// accepts, re-shares without echoing, and already-known blocks merge
/// as no-ops so the flood terminates.
#[tokio::test]
async fn line_topology_floods_every_block() -> Result<()> {
    const N: usize = 4;
    const M: i64 = 2;

    let mut nodes = Vec::with_capacity(N);
    for _ in 0..N {
        nodes.push(node().await?);
    }
    for pair in nodes.windows(2) {
        connect(&pair[0], &pair[1])?;
    }
    settled("line is up", || {
        nodes
            .iter()
            .enumerate()
            .all(|(i, k)| connection_count(k) == if i == 0 || i == N - 1 { 1 } else { 2 })
    })
    .await;

    for kernel in &nodes {
        for n in 1..=M {
            kernel.create_block(COLLECTION, json!(n), None).await?;
        }
    }

    let authors: Vec<_> = nodes.iter().map(|k| k.pk()).collect::<Result<_, _>>()?;
    settled("every node holds every author at the final value", || {
        nodes
            .iter()
            .all(|k| authors.iter().all(|pk| counter_of(k, pk) == M))
    })
    .await;
    Ok(())
}

/// A node joining an already-converged pair receives the full history
/// from its single peer.
#[tokio::test]
async fn late_joiner_receives_everything() -> Result<()> {
    let a = node().await?;
    let b = node().await?;
    connect(&a, &b)?;
    a.create_block(COLLECTION, json!(5), None).await?;
    b.create_block(COLLECTION, json!(7), None).await?;

    let pk_a = a.pk()?;
    let pk_b = b.pk()?;
    settled("pair converged", || {
        counter_of(&a, &pk_b) == 7 && counter_of(&b, &pk_a) == 5
    })
    .await;

    let c = node().await?;
    connect(&b, &c)?;
    settled("joiner holds both histories", || {
        counter_of(&c, &pk_a) == 5 && counter_of(&c, &pk_b) == 7
    })
    .await;
    Ok(())
}
