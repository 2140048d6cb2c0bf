//! Shell pipelines that turn bare machines into an HA k3s cluster backed by an
//! external etcd.

use crate::metadata::Cni;
use crate::ssh::{FakeExecutor, Script, ScriptCollection};

pub const FETCH_ETCD: &str = "fetch etcd binaries";
pub const INSTALL_ETCD: &str = "install etcd binaries";
pub const STORE_ETCD_CERTS: &str = "store etcd certificates";
pub const CONFIGURE_ETCD: &str = "configure etcd unit";
pub const START_ETCD: &str = "start etcd";
pub const INSTALL_HAPROXY: &str = "install haproxy";
pub const ENABLE_HAPROXY: &str = "enable haproxy";
pub const CONFIGURE_HAPROXY: &str = "configure haproxy";
pub const RESTART_HAPROXY: &str = "restart haproxy";
pub const START_FIRST_SERVER: &str = "start first k3s server";
pub const JOIN_SERVER: &str = "join k3s server";
pub const JOIN_TOKEN: &str = "fetch k3s join token";
pub const FETCH_KUBECONFIG: &str = "fetch k3s kubeconfig";
pub const JOIN_AGENT: &str = "join k3s agent";
pub const DELETE_NODE: &str = "delete kubernetes node";

const HAPROXY_VERSION: &str = "3.0";
const API_PORT: u16 = 6443;
const ETCD_CLIENT_PORT: u16 = 2379;
const ETCD_PEER_PORT: u16 = 2380;
const ETCD_DIR: &str = "/var/lib/etcd";

/// What the k3s server scripts are parameterized by.
#[derive(Clone)]
pub struct K3sServer<'a> {
    pub version: &'a str,
    pub cni: Cni,
    pub datastore_ips: &'a [String],
    pub lb_public_ip: &'a str,
    pub lb_private_ip: &'a str,
    pub ca_cert: &'a str,
    pub etcd_cert: &'a str,
    pub etcd_key: &'a str,
}

/// `infra0=https://10.0.0.2:2380,infra1=...`
pub fn etcd_initial_cluster(private_ips: &[String]) -> String {
    private_ips
        .iter()
        .enumerate()
        .map(|(i, ip)| format!("infra{}=https://{}:{}", i, ip, ETCD_PEER_PORT))
        .collect::<Vec<_>>()
        .join(",")
}

/// `https://10.0.0.2:2379,https://10.0.0.3:2379`
pub fn datastore_endpoint(private_ips: &[String]) -> String {
    private_ips
        .iter()
        .map(|ip| format!("https://{}:{}", ip, ETCD_CLIENT_PORT))
        .collect::<Vec<_>>()
        .join(",")
}

fn store_certs(ca: &str, cert: &str, key: &str) -> Script {
    Script::new(
        STORE_ETCD_CERTS,
        format!(
            r#"
sudo mkdir -p {dir}

cat <<EOF > ca.pem
{ca}
EOF

cat <<EOF > etcd.pem
{cert}
EOF

cat <<EOF > etcd-key.pem
{key}
EOF

sudo mv -v ca.pem etcd.pem etcd-key.pem {dir}
"#,
            dir = ETCD_DIR,
            ca = ca.trim_end(),
            cert = cert.trim_end(),
            key = key.trim_end(),
        ),
    )
}

/// Installs and starts etcd member `index` of the datastore ring.
pub fn datastore(
    etcd_version: &str,
    ca: &str,
    cert: &str,
    key: &str,
    private_ips: &[String],
    index: usize,
) -> ScriptCollection {
    let own_ip = private_ips.get(index).map(String::as_str).unwrap_or_default();
    let mut scripts = ScriptCollection::new();
    scripts
        .append(
            Script::new(
                FETCH_ETCD,
                format!(
                    r#"
ETCD_VER={ver}
DOWNLOAD_URL=https://storage.googleapis.com/etcd

sudo rm -f /tmp/etcd-${{ETCD_VER}}-linux-amd64.tar.gz
sudo rm -rf /tmp/etcd-download
mkdir -p /tmp/etcd-download

curl -fL ${{DOWNLOAD_URL}}/${{ETCD_VER}}/etcd-${{ETCD_VER}}-linux-amd64.tar.gz -o /tmp/etcd-${{ETCD_VER}}-linux-amd64.tar.gz
"#,
                    ver = etcd_version
                ),
            )
            .retry(9),
        )
        .append(Script::new(
            INSTALL_ETCD,
            format!(
                r#"
ETCD_VER={ver}
tar xzvf /tmp/etcd-${{ETCD_VER}}-linux-amd64.tar.gz -C /tmp/etcd-download --strip-components=1
sudo rm -f /tmp/etcd-${{ETCD_VER}}-linux-amd64.tar.gz

sudo mv -v /tmp/etcd-download/etcd /tmp/etcd-download/etcdctl /tmp/etcd-download/etcdutl /usr/local/bin
sudo rm -rf /tmp/etcd-download
"#,
                ver = etcd_version
            ),
        ))
        .append(store_certs(ca, cert, key))
        .append(Script::new(
            CONFIGURE_ETCD,
            format!(
                r#"
cat <<EOF > etcd.service
[Unit]
Description=etcd

[Service]
ExecStart=/usr/local/bin/etcd \\
  --name infra{index} \\
  --initial-advertise-peer-urls https://{ip}:{peer} \\
  --listen-peer-urls https://{ip}:{peer} \\
  --listen-client-urls https://{ip}:{client},https://127.0.0.1:{client} \\
  --advertise-client-urls https://{ip}:{client} \\
  --initial-cluster-token etcd-cluster-1 \\
  --initial-cluster {members} \\
  --log-outputs={dir}/etcd.log \\
  --initial-cluster-state new \\
  --peer-auto-tls \\
  --snapshot-count '10000' \\
  --wal-dir={dir}/wal \\
  --client-cert-auth \\
  --trusted-ca-file={dir}/ca.pem \\
  --cert-file={dir}/etcd.pem \\
  --key-file={dir}/etcd-key.pem \\
  --data-dir={dir}/data
Restart=on-failure
RestartSec=5

[Install]
WantedBy=multi-user.target
EOF

sudo mv -v etcd.service /etc/systemd/system
"#,
                index = index,
                ip = own_ip,
                peer = ETCD_PEER_PORT,
                client = ETCD_CLIENT_PORT,
                members = etcd_initial_cluster(private_ips),
                dir = ETCD_DIR,
            ),
        ))
        .append(
            Script::new(
                START_ETCD,
                r#"
sudo systemctl daemon-reload
sudo systemctl enable etcd
sudo systemctl start etcd
"#,
            )
            .retry(3),
        );
    scripts
}

/// Installs HAProxy and balances the API port over every control plane.
pub fn load_balancer(control_plane_ips: &[String]) -> ScriptCollection {
    let servers: String = control_plane_ips
        .iter()
        .enumerate()
        .map(|(i, ip)| format!("  server k3sserver-{} {}:{} check\n", i + 1, ip, API_PORT))
        .collect();

    let mut scripts = ScriptCollection::new();
    scripts
        .append(
            Script::new(
                INSTALL_HAPROXY,
                format!(
                    r#"
sudo DEBIAN_FRONTEND=noninteractive apt-get update -y
sudo DEBIAN_FRONTEND=noninteractive apt-get install --no-install-recommends software-properties-common -y
sudo DEBIAN_FRONTEND=noninteractive add-apt-repository ppa:vbernat/haproxy-{ver} -y
sudo DEBIAN_FRONTEND=noninteractive apt-get install haproxy={ver}.\* -y
"#,
                    ver = HAPROXY_VERSION
                ),
            )
            .retry(9),
        )
        .append(
            Script::new(
                ENABLE_HAPROXY,
                r#"
sudo systemctl start haproxy
sudo systemctl enable haproxy
"#,
            )
            .retry(3),
        )
        .append(Script::new(
            CONFIGURE_HAPROXY,
            format!(
                r#"
cat <<EOF > haproxy.cfg
frontend kubernetes-frontend
  bind *:{port}
  mode tcp
  option tcplog
  timeout client 10s
  default_backend kubernetes-backend

backend kubernetes-backend
  timeout connect 10s
  timeout server 10s
  mode tcp
  option tcp-check
  balance roundrobin
{servers}EOF

sudo mv haproxy.cfg /etc/haproxy/haproxy.cfg
"#,
                port = API_PORT,
                servers = servers
            ),
        ))
        .append(Script::new(RESTART_HAPROXY, "\nsudo systemctl restart haproxy\n").retry(3));
    scripts
}

fn server_flags(server: &K3sServer<'_>) -> String {
    let mut flags = format!(
        r#"  --node-taint CriticalAddonsOnly=true:NoExecute \
  --datastore-endpoint "{endpoint}" \
  --datastore-cafile={dir}/ca.pem \
  --datastore-keyfile={dir}/etcd-key.pem \
  --datastore-certfile={dir}/etcd.pem \
"#,
        endpoint = datastore_endpoint(server.datastore_ips),
        dir = ETCD_DIR,
    );
    if server.cni == Cni::None {
        flags.push_str("  --flannel-backend=none \\\n  --disable-network-policy \\\n");
    }
    flags.push_str(&format!(
        "  --tls-san {} \\\n  --tls-san {}",
        server.lb_public_ip, server.lb_private_ip
    ));
    flags
}

fn install_server(name: &str, server: &K3sServer<'_>, join: Option<&str>) -> Script {
    let join_flags = match join {
        Some(token) => format!(
            "  --token {} \\\n  --server https://{}:{} \\\n",
            token, server.lb_private_ip, API_PORT
        ),
        None => String::new(),
    };
    Script::new(
        name,
        format!(
            r#"
cat <<EOF > k3s-server.sh
#!/bin/bash
/bin/bash /usr/local/bin/k3s-uninstall.sh || echo "nothing to uninstall"
curl -sfL https://get.k3s.io | INSTALL_K3S_CHANNEL="{version}" sh -s - server \
{join}{flags}
EOF

sudo chmod +x k3s-server.sh
sudo ./k3s-server.sh &>> kubeforge.log
"#,
            version = server.version,
            join = join_flags,
            flags = server_flags(server),
        ),
    )
    .retry(9)
}

/// Starts the first control plane against the external datastore.
pub fn first_control_plane(server: &K3sServer<'_>) -> ScriptCollection {
    let mut scripts = ScriptCollection::new();
    scripts
        .append(store_certs(server.ca_cert, server.etcd_cert, server.etcd_key))
        .append(install_server(START_FIRST_SERVER, server, None));
    scripts
}

/// Joins a further control plane through the load balancer.
pub fn joining_control_plane(server: &K3sServer<'_>, token: &str) -> ScriptCollection {
    let mut scripts = ScriptCollection::new();
    scripts
        .append(store_certs(server.ca_cert, server.etcd_cert, server.etcd_key))
        .append(install_server(JOIN_SERVER, server, Some(token)));
    scripts
}

pub fn join_token() -> ScriptCollection {
    Script::new(JOIN_TOKEN, "\nsudo cat /var/lib/rancher/k3s/server/token\n").into()
}

pub fn kubeconfig() -> ScriptCollection {
    Script::new(FETCH_KUBECONFIG, "\nsudo cat /etc/rancher/k3s/k3s.yaml\n").into()
}

/// Joins a worker through the load balancer.
pub fn worker(version: &str, lb_private_ip: &str, token: &str) -> ScriptCollection {
    Script::new(
        JOIN_AGENT,
        format!(
            r#"
cat <<EOF > k3s-agent.sh
#!/bin/bash
/bin/bash /usr/local/bin/k3s-agent-uninstall.sh || echo "nothing to uninstall"
curl -sfL https://get.k3s.io | INSTALL_K3S_CHANNEL="{version}" sh -s - agent --token {token} --server https://{lb}:{port}
EOF

sudo chmod +x k3s-agent.sh
sudo ./k3s-agent.sh &>> kubeforge.log
"#,
            version = version,
            token = token,
            lb = lb_private_ip,
            port = API_PORT,
        ),
    )
    .retry(9)
    .into()
}

/// Removes `hostname` from the cluster; a node that is already gone is fine.
pub fn delete_node(hostname: &str) -> ScriptCollection {
    Script::new(
        DELETE_NODE,
        format!(
            "\nsudo k3s kubectl delete node {} --ignore-not-found\n",
            hostname
        ),
    )
    .retry(3)
    .into()
}

/// A kubeconfig as k3s writes it, used as the canned answer of dry runs.
pub const SAMPLE_K3S_KUBECONFIG: &str = r#"apiVersion: v1
clusters:
- cluster:
    certificate-authority-data: ZmFrZQ==
    server: https://127.0.0.1:6443
  name: default
contexts:
- context:
    cluster: default
    user: default
  name: default
current-context: default
kind: Config
preferences: {}
users:
- name: default
  user:
    client-certificate-data: ZmFrZQ==
    client-key-data: ZmFrZQ==
"#;

/// A fake execution strategy whose token and kubeconfig answers are good
/// enough for the bootstrap phase to complete.
pub fn dry_run_executor() -> FakeExecutor {
    FakeExecutor::new()
        .with_output(JOIN_TOKEN, "K10fake::server:token\n")
        .with_output(FETCH_KUBECONFIG, SAMPLE_K3S_KUBECONFIG)
}

#[cfg(test)]
mod test {
    use super::*;

    fn ips(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    fn server<'a>(ds: &'a [String], cni: Cni) -> K3sServer<'a> {
        K3sServer {
            version: "1.30",
            cni,
            datastore_ips: ds,
            lb_public_ip: "1.2.3.4",
            lb_private_ip: "10.0.0.9",
            ca_cert: "CA",
            etcd_cert: "CERT",
            etcd_key: "KEY",
        }
    }

    fn body(scripts: &ScriptCollection, name: &str) -> String {
        scripts
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.shell_script.clone())
            .unwrap_or_else(|| panic!("no script named {}", name))
    }

    #[test]
    fn etcd_members_and_endpoints_list_every_datastore() {
        let ds = ips(&["10.0.0.2", "10.0.0.3"]);
        assert_eq!(
            etcd_initial_cluster(&ds),
            "infra0=https://10.0.0.2:2380,infra1=https://10.0.0.3:2380"
        );
        assert_eq!(
            datastore_endpoint(&ds),
            "https://10.0.0.2:2379,https://10.0.0.3:2379"
        );
    }

    #[test]
    fn datastore_unit_names_its_own_member() {
        let ds = ips(&["10.0.0.2", "10.0.0.3"]);
        let scripts = datastore("v3.5.15", "CA", "CERT", "KEY", &ds, 1);
        let unit = body(&scripts, CONFIGURE_ETCD);
        assert!(unit.contains("--name infra1"));
        assert!(unit.contains("--listen-peer-urls https://10.0.0.3:2380"));
        assert!(unit.contains("infra0=https://10.0.0.2:2380,infra1=https://10.0.0.3:2380"));
        assert!(body(&scripts, FETCH_ETCD).contains("ETCD_VER=v3.5.15"));
        assert!(scripts.iter().find(|s| s.name == FETCH_ETCD).unwrap().can_retry);
    }

    #[test]
    fn haproxy_backends_follow_control_plane_order() {
        let scripts = load_balancer(&ips(&["10.0.0.4", "10.0.0.5"]));
        let config = body(&scripts, CONFIGURE_HAPROXY);
        assert!(config.contains("  server k3sserver-1 10.0.0.4:6443 check\n"));
        assert!(config.contains("  server k3sserver-2 10.0.0.5:6443 check\n"));
    }

    #[test]
    fn first_server_has_no_join_flags() {
        let ds = ips(&["10.0.0.2"]);
        let scripts = first_control_plane(&server(&ds, Cni::Flannel));
        let install = body(&scripts, START_FIRST_SERVER);
        assert!(install.contains(r#"--datastore-endpoint "https://10.0.0.2:2379""#));
        assert!(install.contains("--tls-san 1.2.3.4"));
        assert!(install.contains("--tls-san 10.0.0.9"));
        assert!(!install.contains("--token"));
        assert!(!install.contains("--flannel-backend=none"));
    }

    #[test]
    fn joining_server_uses_token_and_load_balancer() {
        let ds = ips(&["10.0.0.2"]);
        let scripts = joining_control_plane(&server(&ds, Cni::None), "secret");
        let install = body(&scripts, JOIN_SERVER);
        assert!(install.contains("--token secret"));
        assert!(install.contains("--server https://10.0.0.9:6443"));
        assert!(install.contains("--flannel-backend=none"));
        assert!(install.contains("--disable-network-policy"));
    }

    #[test]
    fn worker_joins_through_private_load_balancer_address() {
        let scripts = worker("1.30", "10.0.0.9", "secret");
        let install = body(&scripts, JOIN_AGENT);
        assert!(install.contains("agent --token secret --server https://10.0.0.9:6443"));
    }
}
