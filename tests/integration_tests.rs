use forge::config::{Config, StorageKind};
use forge::{ClusterMetadata, CloudKind, ClusterType, ErrorKind, Provider};
use kubeforge::Factory;

mod assert;

fn fake_factory() -> Factory {
    Factory::new(Config::fake(std::env::temp_dir())).expect("factory")
}

fn ha_metadata(cloud: CloudKind, region: &str) -> ClusterMetadata {
    let mut meta = ClusterMetadata::new("itest", region, cloud, ClusterType::SelfManaged);
    meta.no_cp = 2;
    meta.no_wp = 1;
    meta.no_ds = 1;
    meta.cp_size = "medium".to_string();
    meta.wp_size = "large".to_string();
    meta.ds_size = "small".to_string();
    meta.lb_size = "small".to_string();
    meta
}

fn managed_metadata(cloud: CloudKind, region: &str) -> ClusterMetadata {
    let mut meta = ClusterMetadata::new("itest", region, cloud, ClusterType::Managed);
    meta.managed_node_count = 2;
    meta
}

#[tokio::test]
async fn ha_cluster_create_list_delete() -> anyhow::Result<()> {
    let factory = fake_factory();
    let meta = ha_metadata(CloudKind::Civo, "lon1");

    let state = factory.orchestrator(meta.clone())?.create_ha().await?;
    assert!(state.is_completed);
    assert_eq!(
        state.cluster_kubeconfig_context,
        "itest-lon1-selfmanaged-civo-kubeforge"
    );
    let lb = state.cloud_infra.load_balancer.vm(0).expect("load balancer");
    assert!(state
        .cluster_kubeconfig
        .contains(&format!("https://{}:6443", lb.public_ip)));

    let listed = assert::listed(&factory, ClusterType::SelfManaged).await?;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].no_cp, 2);
    assert_eq!(listed[0].no_wp, 1);
    assert_eq!(listed[0].cp_size, "medium");
    assert!(listed[0].is_completed);

    let err = factory
        .orchestrator(meta.clone())?
        .create_ha()
        .await
        .expect_err("second create of a finished cluster");
    assert_eq!(err.kind(), ErrorKind::DuplicateRecord);

    factory.orchestrator(meta)?.delete_ha().await?;
    assert::no_cloud_resources_left(&factory);
    assert::nothing_listed(&factory).await?;
    Ok(())
}

#[tokio::test]
async fn ha_cluster_on_azure_and_aws() -> anyhow::Result<()> {
    let factory = fake_factory();
    for meta in [
        ha_metadata(CloudKind::Azure, "eastus"),
        ha_metadata(CloudKind::Aws, "us-east-1"),
    ] {
        let state = factory.orchestrator(meta.clone())?.create_ha().await?;
        assert!(state.is_completed);
        assert!(!state.bootstrap.join_token.is_empty());
        factory.orchestrator(meta)?.delete_ha().await?;
    }
    assert::no_cloud_resources_left(&factory);
    assert::nothing_listed(&factory).await?;
    Ok(())
}

#[tokio::test]
async fn managed_clusters_on_every_backend() -> anyhow::Result<()> {
    let factory = fake_factory();
    for (cloud, region) in [
        (CloudKind::Civo, "lon1"),
        (CloudKind::Azure, "westeurope"),
        (CloudKind::Aws, "eu-west-1"),
        (CloudKind::Local, "local"),
    ] {
        let meta = managed_metadata(cloud, region);
        let state = factory.orchestrator(meta)?.create_managed().await?;
        assert!(state.is_completed, "{} cluster not completed", cloud);
        assert!(!state.cluster_kubeconfig.is_empty());
        assert_eq!(state.cloud_infra.managed.node_count, 2);
    }
    assert_eq!(
        assert::listed(&factory, ClusterType::Managed).await?.len(),
        4
    );

    for (cloud, region) in [
        (CloudKind::Civo, "lon1"),
        (CloudKind::Azure, "westeurope"),
        (CloudKind::Aws, "eu-west-1"),
        (CloudKind::Local, "local"),
    ] {
        factory
            .orchestrator(managed_metadata(cloud, region))?
            .delete_managed()
            .await?;
    }
    assert::no_cloud_resources_left(&factory);
    assert::nothing_listed(&factory).await?;
    Ok(())
}

#[tokio::test]
async fn failed_fresh_create_leaves_nothing_behind() -> anyhow::Result<()> {
    let factory = fake_factory();
    factory.fakes().aws.ledger().fail("create instance");

    let err = factory
        .orchestrator(ha_metadata(CloudKind::Aws, "us-west-2"))?
        .create_ha()
        .await
        .expect_err("instance creation was rejected");
    assert_eq!(err.kind(), ErrorKind::BackendOperationFailed);
    assert!(err.to_string().contains("itest-vm-lb-0"));

    assert::no_cloud_resources_left(&factory);
    assert::nothing_listed(&factory).await?;
    Ok(())
}

#[tokio::test]
async fn workers_scale_through_the_factory() -> anyhow::Result<()> {
    let factory = fake_factory();
    let meta = ha_metadata(CloudKind::Civo, "fra1");
    factory.orchestrator(meta.clone())?.create_ha().await?;

    let mut scaling = ClusterMetadata::new("itest", "fra1", CloudKind::Civo, ClusterType::SelfManaged);
    scaling.wp_size.clear();
    let state = factory
        .orchestrator(scaling.clone())?
        .add_worker_node(3)
        .await?;
    assert_eq!(state.cloud_infra.worker_plane.vms.len(), 3);
    assert!(state
        .cloud_infra
        .worker_plane
        .vms
        .iter()
        .all(|vm| vm.size == "large"));

    let state = factory.orchestrator(scaling)?.del_worker_node(1).await?;
    assert_eq!(state.cloud_infra.worker_plane.vms.len(), 1);
    assert_eq!(factory.fakes().civo.ledger().live("instance"), 5);

    factory.orchestrator(meta)?.delete_ha().await?;
    assert::no_cloud_resources_left(&factory);
    Ok(())
}

#[tokio::test]
async fn local_store_keeps_documents_between_factories() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut config = Config::fake(dir.path().to_path_buf());
    config.storage = StorageKind::Local;

    let first = Factory::new(config.clone())?;
    first
        .orchestrator(managed_metadata(CloudKind::Local, "local"))?
        .create_managed()
        .await?;

    let second = Factory::new(config)?;
    let listed = assert::listed(&second, ClusterType::Managed).await?;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].cloud, CloudKind::Local);
    assert_eq!(listed[0].managed_node_count, 2);
    assert!(dir.path().join("state").exists());
    Ok(())
}

#[tokio::test]
async fn local_backend_refuses_self_managed_clusters() -> anyhow::Result<()> {
    let factory = fake_factory();
    let mut meta = ha_metadata(CloudKind::Local, "local");
    meta.name = "itest-local".to_string();
    let orchestrator = factory.orchestrator(meta)?;
    assert!(!orchestrator.provider().supports_self_managed());

    let err = orchestrator.create_ha().await.expect_err("kind has no VMs");
    assert_eq!(err.kind(), ErrorKind::InvalidUserInput);
    assert::nothing_listed(&factory).await?;
    Ok(())
}
