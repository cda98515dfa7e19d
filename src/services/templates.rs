//! Rendered configuration files and remote command lines
//!
//! Everything here is pure: node lists and settings in, text out.

use crate::cluster::{KeepCerts, Node, WgKeyPair};
use crate::config::KubernetesConfig;
use crate::error::ClusterError;
use crate::utils::networking::format_address;
use anyhow::{Context, Result};
use std::fmt::Write;

pub const MASTER_CONFIG_PATH: &str = "/root/master-config.yaml";
pub const PROVISION_SCRIPT_PATH: &str = "/root/kubestrap-provision.sh";
pub const WIREGUARD_CONFIG_PATH: &str = "/etc/wireguard/wg0.conf";
pub const ETCD_UNIT_PATH: &str = "/etc/systemd/system/etcd.service";
pub const ETCD_DATA_DIR: &str = "/var/lib/etcd";
pub const ETCD_BIN_DIR: &str = "/opt/etcd";
pub const KUBELET_CONF: &str = "/etc/kubernetes/kubelet.conf";
pub const BOOTSTRAP_KUBELET_CONF: &str = "/etc/kubernetes/bootstrap-kubelet.conf";
pub const APISERVER_MANIFEST: &str = "/etc/kubernetes/manifests/kube-apiserver.yaml";
pub const LOAD_BALANCER_CONTAINER: &str = "master-lb";

const PKI_DIR: &str = "/etc/kubernetes/pki";
const PKI_BACKUP_DIR: &str = "/root/pki-backup";
const ETCD_CLIENT_PORT: u16 = 2379;
const ETCD_PEER_PORT: u16 = 2380;
const APISERVER_PORT: u16 = 6443;

/// Certificates an additional master copies from the first one
pub const SHARED_PKI_FILES: [&str; 8] = [
    "/etc/kubernetes/pki/apiserver.crt",
    "/etc/kubernetes/pki/apiserver.key",
    "/etc/kubernetes/pki/ca.crt",
    "/etc/kubernetes/pki/ca.key",
    "/etc/kubernetes/pki/front-proxy-ca.crt",
    "/etc/kubernetes/pki/front-proxy-ca.key",
    "/etc/kubernetes/pki/sa.key",
    "/etc/kubernetes/pki/sa.pub",
];

/// Control-plane kubeconfigs that must talk to the local load balancer
pub const MASTER_KUBECONFIGS: [&str; 4] = [
    "/etc/kubernetes/admin.conf",
    "/etc/kubernetes/kubelet.conf",
    "/etc/kubernetes/controller-manager.conf",
    "/etc/kubernetes/scheduler.conf",
];

// --- WireGuard ---

fn key_pair(node: &Node) -> Result<&WgKeyPair> {
    node.wireguard_key_pair
        .as_ref()
        .with_context(|| format!("{} has no WireGuard key pair", node.name))
}

/// `wg0.conf` for `own`, with every other node as a peer in input order
pub fn render_wireguard_config(own: &Node, nodes: &[Node], port: u16) -> Result<String> {
    let mut out = String::new();
    writeln!(out, "[Interface]")?;
    writeln!(out, "Address = {}", own.private_ip_address)?;
    writeln!(out, "PrivateKey = {}", key_pair(own)?.private)?;
    writeln!(out, "ListenPort = {}", port)?;

    for peer in nodes.iter().filter(|n| n.name != own.name) {
        writeln!(out)?;
        writeln!(out, "# {}", peer.name)?;
        writeln!(out, "[Peer]")?;
        writeln!(out, "PublicKey = {}", key_pair(peer)?.public)?;
        writeln!(out, "AllowedIps = {}/32", peer.private_ip_address)?;
        writeln!(out, "Endpoint = {}", format_address(&peer.ip_address, port))?;
    }

    Ok(out)
}

/// Prints `count` key pairs as `[{..},{..},` for [`parse_key_pairs`]
pub fn generate_key_pairs_command(count: usize) -> String {
    format!(
        concat!(
            "printf '['; for i in $(seq 1 {}); do k=$(wg genkey); ",
            "printf '{{\"private\":\"%s\",\"public\":\"%s\"}},' \"$k\" \"$(printf '%s' \"$k\" | wg pubkey)\"; ",
            "done"
        ),
        count
    )
}

/// Close the unterminated array the key command prints, then parse it
pub fn repair_key_pair_output(raw: &str) -> String {
    let trimmed = raw.trim();
    let body = trimmed.strip_suffix(',').unwrap_or(trimmed);
    format!("{}]", body)
}

pub fn parse_key_pairs(raw: &str, expected: usize) -> Result<Vec<WgKeyPair>, ClusterError> {
    let repaired = repair_key_pair_output(raw);
    let pairs: Vec<WgKeyPair> = serde_json::from_str(&repaired)
        .map_err(|e| ClusterError::MalformedKeyPairs(format!("{}: {}", e, raw.trim())))?;
    if pairs.len() != expected {
        return Err(ClusterError::MalformedKeyPairs(format!(
            "expected {} key pairs, got {}",
            expected,
            pairs.len()
        )));
    }
    Ok(pairs)
}

pub fn enable_wireguard_command() -> String {
    format!(
        "chmod 600 {} && systemctl enable wg-quick@wg0 && systemctl restart wg-quick@wg0",
        WIREGUARD_CONFIG_PATH
    )
}

// --- kubeadm ---

/// kubeadm Init + Cluster configuration for a control-plane node
pub fn render_master_config(
    node: &Node,
    masters: &[Node],
    etcd_nodes: &[Node],
    k8s: &KubernetesConfig,
) -> String {
    let mut sans: Vec<&str> = masters.iter().map(|m| m.private_ip_address.as_str()).collect();
    sans.push("127.0.0.1");
    sans.push(&node.ip_address);
    let mut seen = std::collections::HashSet::new();
    sans.retain(|san| !san.is_empty() && seen.insert(*san));

    let mut out = String::new();
    out.push_str("apiVersion: kubeadm.k8s.io/v1beta3\n");
    out.push_str("kind: InitConfiguration\n");
    out.push_str("localAPIEndpoint:\n");
    out.push_str(&format!("  advertiseAddress: {}\n", node.private_ip_address));
    out.push_str(&format!("  bindPort: {}\n", APISERVER_PORT));
    out.push_str("nodeRegistration:\n");
    out.push_str(&format!("  name: {}\n", node.name));
    out.push_str("  criSocket: unix:///run/containerd/containerd.sock\n");
    out.push_str("---\n");
    out.push_str("apiVersion: kubeadm.k8s.io/v1beta3\n");
    out.push_str("kind: ClusterConfiguration\n");
    out.push_str(&format!("kubernetesVersion: stable-{}\n", k8s.version.trim_start_matches('v')));
    out.push_str("apiServer:\n");
    out.push_str("  certSANs:\n");
    for san in sans {
        out.push_str(&format!("  - {}\n", san));
    }
    out.push_str("networking:\n");
    out.push_str(&format!("  podSubnet: {}\n", k8s.pod_subnet));
    if !etcd_nodes.is_empty() {
        out.push_str("etcd:\n");
        out.push_str("  external:\n");
        out.push_str("    endpoints:\n");
        for etcd in etcd_nodes {
            out.push_str(&format!(
                "    - http://{}\n",
                format_address(&etcd.private_ip_address, ETCD_CLIENT_PORT)
            ));
        }
    }
    out
}

fn preserve_pki(sources: &str) -> String {
    format!(
        concat!(
            "rm -rf {backup} && mkdir -p {backup} && ",
            "{{ cp -a {sources} {backup}/ 2>/dev/null || true; }} && ",
            "kubeadm reset -f && mkdir -p {pki} && cp -a {backup}/. {pki}/"
        ),
        backup = PKI_BACKUP_DIR,
        sources = sources,
        pki = PKI_DIR,
    )
}

/// Reset a control-plane node, keeping the PKI material `keep` selects
pub fn kubeadm_reset_command(keep: KeepCerts) -> String {
    match keep {
        KeepCerts::None => format!("kubeadm reset -f && rm -rf {}", PKI_DIR),
        KeepCerts::Ca => preserve_pki(&format!("{pki}/ca.crt {pki}/ca.key", pki = PKI_DIR)),
        KeepCerts::All => preserve_pki(&format!("{}/.", PKI_DIR)),
    }
}

pub fn kubeadm_init_command() -> String {
    format!(
        "kubeadm init --config {} --ignore-preflight-errors=all",
        MASTER_CONFIG_PATH
    )
}

pub fn configure_kubectl_command() -> String {
    "mkdir -p $HOME/.kube && cp -f /etc/kubernetes/admin.conf $HOME/.kube/config".to_string()
}

pub fn install_pod_network_command(k8s: &KubernetesConfig) -> String {
    format!("kubectl apply -f {}", k8s.pod_network_manifest)
}

pub fn remove_master_taint_command() -> String {
    "kubectl taint nodes --all node-role.kubernetes.io/control-plane-".to_string()
}

pub fn join_token_command() -> String {
    "kubeadm token create --print-join-command".to_string()
}

pub fn join_command(join: &str) -> String {
    format!("{} --ignore-preflight-errors=all", join.trim())
}

/// Point every `server:` entry of a kubeconfig at `https://<endpoint>`
pub fn point_kubeconfig_at(content: &str, endpoint: &str) -> String {
    let mut out = String::with_capacity(content.len());
    for line in content.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("server: ") {
            let indent = &line[..line.len() - trimmed.len()];
            out.push_str(&format!("{}server: https://{}\n", indent, endpoint));
        } else {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

/// Declare the API server replica count in its static pod manifest.
///
/// Fails when the manifest has no `- kube-apiserver` command entry to anchor on.
pub fn set_apiserver_count(manifest: &str, count: usize) -> Result<String> {
    let mut out = String::with_capacity(manifest.len() + 32);
    let mut anchored = false;
    for line in manifest.lines() {
        if line.trim_start().starts_with("- --apiserver-count=") {
            continue;
        }
        out.push_str(line);
        out.push('\n');
        let trimmed = line.trim_start();
        if trimmed == "- kube-apiserver" {
            let indent = &line[..line.len() - trimmed.len()];
            out.push_str(&format!("{}- --apiserver-count={}\n", indent, count));
            anchored = true;
        }
    }
    if !anchored {
        anyhow::bail!("kube-apiserver manifest has no '- kube-apiserver' command entry");
    }
    Ok(out)
}

/// Repoint a kubeconfig at `https://<endpoint>` on the node, if the file exists
pub fn rewrite_kubeconfig_if_present_command(path: &str, endpoint: &str) -> String {
    format!(
        "if [ -f {path} ]; then sed -i 's#server: https://.*#server: https://{endpoint}#g' {path}; fi",
        path = path,
        endpoint = endpoint
    )
}

pub fn kube_proxy_rewrite_command(lb_port: u16) -> String {
    format!(
        concat!(
            "kubectl -n kube-system get configmap kube-proxy -o yaml | ",
            "sed 's#server: https://.*#server: https://127.0.0.1:{}#g' | ",
            "kubectl apply -f - && ",
            "kubectl -n kube-system delete pod -l k8s-app=kube-proxy"
        ),
        lb_port
    )
}

pub fn apiserver_ready_command() -> String {
    "kubectl --kubeconfig /etc/kubernetes/admin.conf get node".to_string()
}

/// Replace any running load balancer with one for the current masters
pub fn load_balancer_command(k8s: &KubernetesConfig, masters: &[Node]) -> String {
    let ips: Vec<&str> = masters.iter().map(|m| m.private_ip_address.as_str()).collect();
    format!(
        concat!(
            "docker rm -f {name} >/dev/null 2>&1 || true; ",
            "docker run -d --name={name} --restart=unless-stopped -p {port}:{port} {image} {ips}"
        ),
        name = LOAD_BALANCER_CONTAINER,
        port = k8s.load_balancer_port,
        image = k8s.load_balancer_image,
        ips = ips.join(" "),
    )
}

// --- etcd ---

/// `name=http://ip:2380,...` over all members in input order
pub fn initial_cluster(etcd_nodes: &[Node]) -> String {
    etcd_nodes
        .iter()
        .map(|n| {
            format!(
                "{}=http://{}",
                n.name,
                format_address(&n.private_ip_address, ETCD_PEER_PORT)
            )
        })
        .collect::<Vec<_>>()
        .join(",")
}

pub fn peer_url(node: &Node) -> String {
    format!("http://{}", format_address(&node.private_ip_address, ETCD_PEER_PORT))
}

pub fn render_etcd_unit(node: &Node, etcd_nodes: &[Node]) -> String {
    let client_url = format!(
        "http://{}",
        format_address(&node.private_ip_address, ETCD_CLIENT_PORT)
    );
    let peer = peer_url(node);

    format!(
        r#"[Unit]
Description=etcd key-value store
Documentation=https://github.com/etcd-io/etcd
After=network-online.target wg-quick@wg0.service
Wants=network-online.target

[Service]
Type=notify
ExecStart={bin}/etcd --name {name} --data-dir {data} --listen-client-urls {client},http://127.0.0.1:{client_port} --advertise-client-urls {client} --listen-peer-urls {peer} --initial-advertise-peer-urls {peer} --initial-cluster "{cluster}" --initial-cluster-token etcd-cluster --initial-cluster-state new
Restart=always
RestartSec=5s
LimitNOFILE=40000

[Install]
WantedBy=multi-user.target
"#,
        bin = ETCD_BIN_DIR,
        name = node.name,
        data = ETCD_DATA_DIR,
        client = client_url,
        client_port = ETCD_CLIENT_PORT,
        peer = peer,
        cluster = initial_cluster(etcd_nodes),
    )
}

pub fn install_etcd_command(k8s: &KubernetesConfig) -> String {
    let version = &k8s.etcd_version;
    format!(
        concat!(
            "mkdir -p {bin} && ",
            "curl -fsSL {url}/{v}/etcd-{v}-linux-amd64.tar.gz | tar xz -C {bin} --strip-components=1"
        ),
        bin = ETCD_BIN_DIR,
        url = k8s.etcd_download_url.trim_end_matches('/'),
        v = version,
    )
}

pub fn remove_etcd_data_command() -> String {
    format!(
        "systemctl daemon-reload && systemctl stop etcd && rm -rf {}",
        ETCD_DATA_DIR
    )
}

pub fn start_etcd_command() -> String {
    "systemctl daemon-reload && systemctl enable etcd && systemctl restart etcd".to_string()
}

// --- provisioning ---

pub fn render_provision_script(k8s: &KubernetesConfig) -> String {
    let channel = format!("https://pkgs.k8s.io/core:/stable:/{}/deb", k8s.version);
    format!(
        r#"#!/bin/bash
set -euo pipefail
export DEBIAN_FRONTEND=noninteractive

cat > /etc/modules-load.d/kubestrap.conf <<EOF
overlay
br_netfilter
wireguard
EOF
modprobe overlay
modprobe br_netfilter

cat > /etc/sysctl.d/99-kubestrap.conf <<EOF
net.bridge.bridge-nf-call-iptables = 1
net.bridge.bridge-nf-call-ip6tables = 1
net.ipv4.ip_forward = 1
EOF
sysctl --system >/dev/null

swapoff -a
sed -i '/ swap / s/^/#/' /etc/fstab

apt-get update -q
apt-get install -y -q apt-transport-https ca-certificates curl gpg wireguard docker.io containerd

mkdir -p /etc/apt/keyrings
curl -fsSL {channel}/Release.key | gpg --dearmor --yes -o /etc/apt/keyrings/kubernetes-apt-keyring.gpg
echo "deb [signed-by=/etc/apt/keyrings/kubernetes-apt-keyring.gpg] {channel}/ /" > /etc/apt/sources.list.d/kubernetes.list
apt-get update -q
apt-get install -y -q kubelet kubeadm kubectl
apt-mark hold kubelet kubeadm kubectl

mkdir -p /etc/containerd
containerd config default | sed 's/SystemdCgroup = false/SystemdCgroup = true/' > /etc/containerd/config.toml
systemctl restart containerd
systemctl enable --now docker kubelet
"#,
        channel = channel
    )
}

pub fn run_provision_script_command() -> String {
    format!("bash {}", PROVISION_SCRIPT_PATH)
}
