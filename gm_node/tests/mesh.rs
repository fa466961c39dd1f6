// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Whole-mesh scenarios over the in-memory transport: several nodes in one
//! process, no sockets.

use gm_comms::MemoryTransport;
use gm_interface::{
    now_secs,
    trust::{
        sign_object, CertificateRevocationList, ControlMessage, GenesisBlock, JoinCertificate,
        NetworkAuthority, PolicyManifestRef,
    },
    types::keys::{encode_public, gen_keypair, Keypair},
};
use gm_node::{MeshNode, NodeContext};

use eyre::Result;
use std::{future::Future, sync::Arc, time::Duration};
use uuid::Uuid;

const TIMEOUT: Duration = Duration::from_secs(5);

struct TestNet {
    root: Keypair,
    na: Keypair,
}

impl TestNet {
    fn new() -> Self {
        Self {
            root: gen_keypair(),
            na: gen_keypair(),
        }
    }

    fn genesis(&self) -> GenesisBlock {
        let mut genesis = GenesisBlock {
            network_name: "TEST".to_string(),
            network_version: "1.0".to_string(),
            root_public_key: encode_public(&self.root.public),
            network_authority: NetworkAuthority {
                public_key: encode_public(&self.na.public),
                valid_from: 0,
                valid_to: u64::MAX,
            },
            allowed_crypto_suites: vec!["ed25519".to_string()],
            allowed_transports: vec!["memory".to_string()],
            policy_manifest: PolicyManifestRef {
                hash: "sha256:00".to_string(),
                url: None,
            },
            bootstrap_anchors: vec![],
            signatures: vec![],
        };
        genesis.sign(&self.root, "root-1").expect("sign genesis");
        genesis
    }

    fn certificate(&self, holder: &Keypair, roles: &[&str]) -> JoinCertificate {
        let now = now_secs();
        let mut cert = JoinCertificate {
            cert_id: Uuid::new_v4().to_string(),
            node_public_key: encode_public(&holder.public),
            network_name: "TEST".to_string(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            issued_at: now.saturating_sub(60),
            expires_at: now + 86_400,
            issued_by: "na-1".to_string(),
            signatures: vec![],
        };
        let sig = sign_object(&cert, &self.na, "na-1").expect("sign cert");
        cert.signatures.push(sig);
        cert
    }

    async fn node(&self, roles: &[&str]) -> Arc<MeshNode> {
        let keypair = gen_keypair();
        let cert = self.certificate(&keypair, roles);
        let mut ctx = NodeContext::new(
            self.genesis(),
            keypair,
            roles.iter().map(|r| r.to_string()).collect(),
        );
        ctx.certificate = Some(cert);
        let node = MeshNode::new(ctx).expect("node");
        node.start().await;
        node
    }

    fn signed_crl(&self, sequence: u64) -> CertificateRevocationList {
        let mut crl = CertificateRevocationList::empty("na-1", sequence, now_secs(), 86_400);
        let sig = sign_object(&crl, &self.na, "na-1").expect("sign crl");
        crl.signatures.push(sig);
        crl
    }
}

/// Handshake `dialer` into `listener` over a fresh in-memory pair.
async fn link(dialer: &Arc<MeshNode>, listener: &Arc<MeshNode>) -> Result<()> {
    let (out_end, in_end) = MemoryTransport::pair(256);
    listener.accept_transport(Box::new(in_end)).await?;
    dialer.connect_transport(Box::new(out_end)).await?;

    let dialer_id = dialer.id().to_string();
    let listener_id = listener.id().to_string();
    wait_until(
        || async {
            dialer.neighbors().await.contains(&listener_id)
                && listener.neighbors().await.contains(&dialer_id)
        },
        "handshake to settle",
    )
    .await;
    Ok(())
}

async fn wait_until<F, Fut>(mut check: F, what: &str)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn handshake_admits_peers_both_ways() -> Result<()> {
    let net = TestNet::new();
    let a = net.node(&["role:client"]).await;
    let b = net.node(&["role:anchor"]).await;

    link(&a, &b).await?;

    assert!(a.neighbors().await.contains(&b.id().to_string()));
    assert!(b.neighbors().await.contains(&a.id().to_string()));
    assert_eq!(a.metrics().await.connected_peers, 1);

    a.stop().await;
    b.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn line_topology_converges_and_forwards_data() -> Result<()> {
    let net = TestNet::new();
    let a = net.node(&["role:client"]).await;
    let b = net.node(&["role:bridge"]).await;
    let c = net.node(&["role:client"]).await;

    link(&a, &b).await?;
    link(&c, &b).await?;

    // one announce cycle from the edge inward
    c.trigger_route_announce().await;
    wait_until(
        || async {
            b.route_to(c.id())
                .await
                .map(|r| r.sequence > 0)
                .unwrap_or(false)
        },
        "b to learn c's sequence",
    )
    .await;
    b.trigger_route_announce().await;

    let c_id = c.id().to_string();
    wait_until(
        || async { a.route_to(&c_id).await.is_some() },
        "a to learn a route to c",
    )
    .await;

    let route = a.route_to(&c_id).await.expect("route");
    assert_eq!(route.next_hop, b.id());
    assert_eq!(route.metric, 2);
    let c_route_at_b = b.route_to(&c_id).await.expect("route at b");
    assert_eq!(route.sequence, c_route_at_b.sequence);

    // data flows a -> b -> c
    let mut inbox = c.take_data_receiver().await.expect("data receiver");
    let outcome = a.send_data(&c_id, b"through the middle").await;
    assert!(matches!(
        outcome,
        gm_node::routing::RouteOutcome::Forwarded(_)
    ));
    let (sender, bytes) = tokio::time::timeout(TIMEOUT, inbox.recv())
        .await?
        .expect("delivery");
    assert_eq!(sender, a.id());
    assert_eq!(bytes, b"through the middle");

    a.stop().await;
    b.stop().await;
    c.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn crl_progression_over_gossip() -> Result<()> {
    let net = TestNet::new();
    let a = net.node(&["role:anchor"]).await;
    let b = net.node(&["role:client"]).await;
    link(&a, &b).await?;

    // an emergency push installs on the peer
    a.crl().push_emergency(net.signed_crl(5)).await;
    wait_until(
        || async { b.crl().current_sequence().await == Some(5) },
        "b to install seq 5",
    )
    .await;

    // a well-formed but older CRL is ignored
    a.crl().push_emergency(net.signed_crl(4)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(b.crl().current_sequence().await, Some(5));

    // and a newer one supersedes
    a.crl().push_emergency(net.signed_crl(6)).await;
    wait_until(
        || async { b.crl().current_sequence().await == Some(6) },
        "b to install seq 6",
    )
    .await;

    a.stop().await;
    b.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn revoked_certificate_cannot_handshake() -> Result<()> {
    let net = TestNet::new();
    let a = net.node(&["role:client"]).await;
    let b = net.node(&["role:client"]).await;

    // b learns a CRL revoking the cert of the node that will dial it
    let revoked_keys = gen_keypair();
    let revoked_cert = net.certificate(&revoked_keys, &["role:client"]);
    let mut crl = net
        .signed_crl(0)
        .with_revocation(&revoked_cert.cert_id, "compromise", "na-1", now_secs());
    crl.sequence = 1;
    crl.signatures.clear();
    let sig = sign_object(&crl, &net.na, "na-1").expect("sign");
    crl.signatures.push(sig);
    assert!(b.crl().install(crl).await);

    let mut ctx = NodeContext::new(
        net.genesis(),
        revoked_keys,
        vec!["role:client".to_string()],
    );
    ctx.certificate = Some(revoked_cert);
    let outcast = MeshNode::new(ctx).expect("node");
    outcast.start().await;

    let (out_end, in_end) = MemoryTransport::pair(256);
    b.accept_transport(Box::new(in_end)).await?;
    outcast.connect_transport(Box::new(out_end)).await?;

    // the handshake is refused: no neighbor relationship forms
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!b.neighbors().await.contains(&outcast.id().to_string()));

    // an untouched node is still welcome
    link(&a, &b).await?;

    a.stop().await;
    b.stop().await;
    outcast.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn control_plane_shutdown_reaches_the_target() -> Result<()> {
    let net = TestNet::new();
    let admin = gen_keypair();
    let a = net.node(&["role:operator"]).await;
    let b = net.node(&["role:client"]).await;
    link(&a, &b).await?;

    b.register_trusted_key("admin-1", &encode_public(&admin.public))
        .await;

    let roles = vec!["role:admin".to_string()];
    let mut shutdown_watch = b.shutdown_requests();
    let mut msg = ControlMessage::shutdown_node(
        "admin-1",
        &roles,
        b.id(),
        "maintenance window",
        0,
        now_secs(),
    );
    let sig = sign_object(&msg, &admin, "admin-1").expect("sign");
    msg.signatures.push(sig);

    assert_eq!(a.broadcast_control(&msg).await?, 1);

    tokio::time::timeout(TIMEOUT, shutdown_watch.changed()).await??;
    let reason = shutdown_watch.borrow().clone().expect("reason");
    assert_eq!(reason, "maintenance window");

    // the same message again is replay-rejected: no second change fires
    assert_eq!(a.broadcast_control(&msg).await?, 1);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(b.metrics().await.control_rejected, 1);

    a.stop().await;
    b.stop().await;
    Ok(())
}
