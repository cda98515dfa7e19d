use super::{ClusterManager, Step};
use crate::cluster::ClusterProvider;
use crate::services::templates::{
    WIREGUARD_CONFIG_PATH, enable_wireguard_command, generate_key_pairs_command,
    parse_key_pairs, render_wireguard_config,
};
use anyhow::{Context, Result};
use tracing::info;

impl ClusterManager {
    /// Assign mesh addresses and key pairs, then push a WireGuard config to every node.
    ///
    /// Existing key pairs and addresses are never replaced. Missing key pairs
    /// are generated in one batch on the first node.
    pub async fn setup_encrypted_network(&self) -> Result<()> {
        let mut cluster = self.get_cluster();
        let Some(generator) = cluster.nodes.first().cloned() else {
            return Ok(());
        };

        cluster.assign_mesh_addresses()?;

        let missing: Vec<usize> = cluster
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.wireguard_key_pair.is_none())
            .map(|(i, _)| i)
            .collect();

        if !missing.is_empty() {
            info!(count = missing.len(), node = %generator.name, "generating WireGuard key pairs");
            let output = self
                .communicator()
                .run_cmd(&generator, &generate_key_pairs_command(missing.len()))
                .await
                .with_context(|| format!("{}: generate key pairs", generator.name))?;
            let pairs = parse_key_pairs(&output, missing.len())?;
            for (index, pair) in missing.into_iter().zip(pairs) {
                cluster.nodes[index].wireguard_key_pair = Some(pair);
            }
        }

        self.store_nodes(&cluster.nodes);

        let nodes = cluster.nodes;
        let port = self.config().kubernetes.wireguard_port;
        self.run_on_nodes(nodes.clone(), |node| {
            Ok(vec![
                Step::upload(
                    "configure wireguard",
                    WIREGUARD_CONFIG_PATH,
                    render_wireguard_config(node, &nodes, port)?,
                    false,
                ),
                Step::run("enable wireguard", enable_wireguard_command()),
            ])
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use crate::cluster::{ClusterProvider, WgKeyPair};
    use crate::error::ClusterError;
    use crate::testing::{cluster, harness};

    const TWO_PAIRS: &str =
        "[{\"private\":\"p1\",\"public\":\"P1\"},{\"private\":\"p2\",\"public\":\"P2\"},";

    #[tokio::test]
    async fn test_network_assigns_keys_and_pushes_configs() {
        let mut c = cluster(1, 0, 1);
        for node in &mut c.nodes {
            node.private_ip_address.clear();
        }
        let h = harness(c);
        h.fake.respond("wg genkey", TWO_PAIRS);

        h.manager.setup_encrypted_network().await.unwrap();

        let stored = h.manager.get_cluster();
        assert_eq!(stored.nodes[0].private_ip_address, "10.0.1.11");
        assert_eq!(stored.nodes[1].private_ip_address, "10.0.1.12");
        assert_eq!(stored.nodes[1].wireguard_key_pair.as_ref().unwrap().public, "P2");

        let conf = h.fake.file("worker-1", "/etc/wireguard/wg0.conf").unwrap();
        assert!(conf.contains("PrivateKey = p2"));
        assert!(conf.contains("# master-1"));
        assert!(conf.contains("PublicKey = P1"));
        assert!(!conf.contains("PublicKey = P2"));

        let generated = h
            .fake
            .log()
            .iter()
            .filter(|(_, c)| c.contains("wg genkey"))
            .count();
        assert_eq!(generated, 1);
        assert_eq!(
            h.events.events_for("master-1"),
            ["configure wireguard", "enable wireguard", "completed"]
        );
    }

    #[tokio::test]
    async fn test_existing_key_pairs_are_kept() {
        let mut c = cluster(1, 0, 1);
        c.nodes[0].wireguard_key_pair = Some(WgKeyPair {
            private: "keep".to_string(),
            public: "KEEP".to_string(),
        });
        let h = harness(c);
        h.fake
            .respond("seq 1 1", "[{\"private\":\"new\",\"public\":\"NEW\"},");

        h.manager.setup_encrypted_network().await.unwrap();

        let stored = h.manager.get_cluster();
        assert_eq!(stored.nodes[0].wireguard_key_pair.as_ref().unwrap().private, "keep");
        assert_eq!(stored.nodes[1].wireguard_key_pair.as_ref().unwrap().private, "new");
    }

    #[tokio::test]
    async fn test_malformed_key_output_is_rejected() {
        let h = harness(cluster(1, 0, 1));
        h.fake.respond("wg genkey", "bash: wg: command not found");

        let err = h.manager.setup_encrypted_network().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ClusterError>(),
            Some(ClusterError::MalformedKeyPairs(_))
        ));
        assert!(h.fake.file("worker-1", "/etc/wireguard/wg0.conf").is_none());
    }
}
