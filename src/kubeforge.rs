use forge::config::{Config, Opts};
use forge::store::ClusterFilter;
use forge::{ClusterMetadata, Cni, CloudKind, ClusterType, StateDocument};
use kubeforge::Factory;
use structopt::StructOpt;
use tracing::info;

#[derive(StructOpt, Debug)]
#[structopt(
    name = "kubeforge",
    about = "Provision, bootstrap and tear down Kubernetes clusters"
)]
struct Cli {
    #[structopt(flatten)]
    opts: Opts,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(StructOpt, Debug)]
struct Identity {
    #[structopt(long, help = "Cluster name")]
    name: String,

    #[structopt(long, help = "Backend: civo, azure, aws or local")]
    provider: CloudKind,

    #[structopt(long, help = "Region the cluster lives in")]
    region: String,
}

#[derive(StructOpt, Debug)]
struct HaArgs {
    #[structopt(flatten)]
    identity: Identity,

    #[structopt(long, default_value = "3", help = "Number of control plane nodes")]
    control_planes: usize,

    #[structopt(long, default_value = "1", help = "Number of worker nodes")]
    workers: usize,

    #[structopt(long, default_value = "1", help = "Number of etcd datastore nodes")]
    datastores: usize,

    #[structopt(long, help = "VM size of control plane nodes")]
    cp_size: String,

    #[structopt(long, help = "VM size of worker nodes")]
    wp_size: String,

    #[structopt(long, help = "VM size of datastore nodes")]
    ds_size: String,

    #[structopt(long, help = "VM size of the load balancer")]
    lb_size: String,

    #[structopt(long, default_value = "1.30", help = "Kubernetes (k3s) version")]
    version: String,

    #[structopt(long, default_value = "v3.5.15", help = "etcd version")]
    etcd_version: String,

    #[structopt(long, default_value = "flannel", possible_values = &["flannel", "none"])]
    cni: Cni,
}

#[derive(StructOpt, Debug)]
struct ManagedArgs {
    #[structopt(flatten)]
    identity: Identity,

    #[structopt(long, default_value = "1", help = "Number of nodes")]
    nodes: usize,

    #[structopt(long, default_value = "", help = "Node size; the backend default when empty")]
    node_size: String,

    #[structopt(long, default_value = "1.30", help = "Kubernetes version")]
    version: String,
}

#[derive(StructOpt, Debug)]
enum Command {
    /// Create, or resume creating, a self-managed HA cluster
    CreateHa(HaArgs),
    /// Create, or resume creating, a vendor hosted cluster
    CreateManaged(ManagedArgs),
    /// Tear down a self-managed HA cluster
    DeleteHa(Identity),
    /// Tear down a vendor hosted cluster
    DeleteManaged(Identity),
    /// Grow the worker pool of a self-managed cluster to a total count
    AddWorkers {
        #[structopt(flatten)]
        identity: Identity,
        #[structopt(long, help = "Desired total number of workers")]
        desired: usize,
    },
    /// Shrink the worker pool of a self-managed cluster to a total count
    DelWorkers {
        #[structopt(flatten)]
        identity: Identity,
        #[structopt(long, help = "Desired total number of workers")]
        desired: usize,
    },
    /// List stored clusters
    List {
        #[structopt(long, help = "Only clusters on this backend")]
        provider: Option<CloudKind>,
        #[structopt(long, help = "Only clusters of this type")]
        cluster_type: Option<ClusterType>,
    },
}

impl Identity {
    fn metadata(&self, cluster_type: ClusterType) -> ClusterMetadata {
        ClusterMetadata::new(
            self.name.clone(),
            self.region.clone(),
            self.provider,
            cluster_type,
        )
    }
}

impl HaArgs {
    fn metadata(self) -> ClusterMetadata {
        let mut meta = self.identity.metadata(ClusterType::SelfManaged);
        meta.no_cp = self.control_planes;
        meta.no_wp = self.workers;
        meta.no_ds = self.datastores;
        meta.cp_size = self.cp_size;
        meta.wp_size = self.wp_size;
        meta.ds_size = self.ds_size;
        meta.lb_size = self.lb_size;
        meta.k8s_version = self.version;
        meta.etcd_version = self.etcd_version;
        meta.cni = self.cni;
        meta
    }
}

impl ManagedArgs {
    fn metadata(self) -> ClusterMetadata {
        let mut meta = self.identity.metadata(ClusterType::Managed);
        meta.managed_node_count = self.nodes;
        meta.managed_node_size = self.node_size;
        meta.k8s_version = self.version;
        meta
    }
}

/// Writes the kubeconfig of a finished cluster next to its state.
async fn save_kubeconfig(config: &Config, state: &StateDocument) -> anyhow::Result<()> {
    if state.cluster_kubeconfig.is_empty() {
        return Ok(());
    }
    let path = config
        .data_dir
        .join("kubeconfigs")
        .join(format!("{}.yaml", state.context_name()));
    forge::kubeconfig::save(&path, &state.cluster_kubeconfig).await?;
    info!(path = %path.display(), context = %state.cluster_kubeconfig_context, "wrote kubeconfig");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::from_args();
    let config = Config::from_opts(cli.opts)?;
    let factory = Factory::new(config)?;

    match cli.command {
        Command::CreateHa(args) => {
            let state = factory.orchestrator(args.metadata())?.create_ha().await?;
            save_kubeconfig(factory.config(), &state).await?;
        }
        Command::CreateManaged(args) => {
            let state = factory
                .orchestrator(args.metadata())?
                .create_managed()
                .await?;
            save_kubeconfig(factory.config(), &state).await?;
        }
        Command::DeleteHa(identity) => {
            factory
                .orchestrator(identity.metadata(ClusterType::SelfManaged))?
                .delete_ha()
                .await?;
        }
        Command::DeleteManaged(identity) => {
            factory
                .orchestrator(identity.metadata(ClusterType::Managed))?
                .delete_managed()
                .await?;
        }
        Command::AddWorkers { identity, desired } => {
            factory
                .orchestrator(identity.metadata(ClusterType::SelfManaged))?
                .add_worker_node(desired)
                .await?;
        }
        Command::DelWorkers { identity, desired } => {
            factory
                .orchestrator(identity.metadata(ClusterType::SelfManaged))?
                .del_worker_node(desired)
                .await?;
        }
        Command::List {
            provider,
            cluster_type,
        } => {
            let filter = ClusterFilter {
                cloud: provider,
                cluster_type,
                ..ClusterFilter::default()
            };
            let clusters = factory.list(&filter).await?;
            println!("{}", serde_json::to_string_pretty(&clusters)?);
        }
    }
    Ok(())
}
