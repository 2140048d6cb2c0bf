use forge::store::ClusterFilter;
use forge::{ClusterInfo, ClusterType};
use kubeforge::Factory;

/// Fails when any in-memory backend still holds a resource.
pub fn no_cloud_resources_left(factory: &Factory) {
    let fakes = factory.fakes();
    let leftovers = [
        ("civo", fakes.civo.ledger().live_ids()),
        ("azure", fakes.azure.ledger().live_ids()),
        ("aws", fakes.aws.ledger().live_ids()),
        ("kind", fakes.kind.ledger().live_ids()),
    ];
    for (backend, ids) in leftovers.iter() {
        assert!(ids.is_empty(), "{} still holds {:?}", backend, ids);
    }
}

pub async fn listed(factory: &Factory, cluster_type: ClusterType) -> anyhow::Result<Vec<ClusterInfo>> {
    let filter = ClusterFilter {
        cluster_type: Some(cluster_type),
        ..ClusterFilter::default()
    };
    Ok(factory.list(&filter).await?)
}

pub async fn nothing_listed(factory: &Factory) -> anyhow::Result<()> {
    let clusters = factory.list(&ClusterFilter::default()).await?;
    assert!(
        clusters.is_empty(),
        "Expected no stored clusters but got {:?}",
        clusters
    );
    Ok(())
}
