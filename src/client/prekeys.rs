//! Pre-key registration and bundle fetch over `iq xmlns=encrypt`.

use crate::binary::Node;
use crate::error::BinaryError;
use crate::signal::{PreKeyBundle, SignalRepository};
use crate::store::creds::{AuthenticationCreds, PreKeyBatch};
use crate::types::Jid;

/// Key type byte for Curve25519 keys on the wire.
const KEY_TYPE_DJB: u8 = 0x05;

fn id_bytes(id: u32) -> Vec<u8> {
    id.to_be_bytes()[1..].to_vec()
}

fn read_id(content: &[u8]) -> Option<u32> {
    match content.len() {
        3 => Some(u32::from_be_bytes([0, content[0], content[1], content[2]])),
        4 => Some(u32::from_be_bytes(content.try_into().ok()?)),
        _ => None,
    }
}

fn key_node(id: u32, public: &[u8; 32]) -> Node {
    Node::new("key").with_children(vec![
        Node::new("id").with_content(id_bytes(id)),
        Node::new("value").with_content(public.to_vec()),
    ])
}

/// Build the registration IQ that uploads a freshly issued pre-key batch
/// together with the identity and signed pre-key material.
pub fn build_pre_key_upload_node(creds: &AuthenticationCreds, batch: &PreKeyBatch) -> Node {
    let key_nodes: Vec<Node> = batch
        .new_pre_keys
        .iter()
        .map(|k| key_node(k.id, &k.key_pair.public))
        .collect();
    Node::new("iq")
        .with_attr("type", "set")
        .with_attr("xmlns", "encrypt")
        .with_attr("to", Jid::default_server().to_string())
        .with_children(vec![
            Node::new("registration")
                .with_content((creds.registration_id as u32).to_be_bytes().to_vec()),
            Node::new("type").with_content(vec![KEY_TYPE_DJB]),
            Node::new("identity").with_content(creds.signed_identity_key.public.to_vec()),
            Node::new("list").with_children(key_nodes),
            Node::new("skey").with_children(vec![
                Node::new("id").with_content(id_bytes(creds.signed_pre_key.id)),
                Node::new("value").with_content(creds.signed_pre_key.key_pair.public.to_vec()),
                Node::new("signature").with_content(creds.signed_pre_key.signature.to_vec()),
            ]),
        ])
}

/// Build the prekey bundle fetch for the given device JIDs.
pub fn build_pre_key_fetch_node(jids: &[Jid]) -> Node {
    let user_nodes = jids
        .iter()
        .map(|j| Node::new("user").with_attr("jid", j.to_string()))
        .collect();
    Node::new("iq")
        .with_attr("type", "get")
        .with_attr("xmlns", "encrypt")
        .with_attr("to", Jid::default_server().to_string())
        .with_children(vec![Node::new("key").with_children(user_nodes)])
}

fn content_array<const N: usize>(node: &Node, what: &str) -> Result<[u8; N], BinaryError> {
    node.content_bytes()
        .and_then(|b| <[u8; N]>::try_from(b).ok())
        .ok_or_else(|| BinaryError::MalformedFrame(format!("bad {what} in bundle")))
}

fn parse_key_pair_node(node: &Node) -> Result<(u32, [u8; 32]), BinaryError> {
    let id = node
        .get_child_by_tag("id")
        .and_then(|n| n.content_bytes())
        .and_then(read_id)
        .ok_or_else(|| BinaryError::MalformedFrame("key without id".into()))?;
    let value = node
        .get_child_by_tag("value")
        .ok_or_else(|| BinaryError::MalformedFrame("key without value".into()))?;
    Ok((id, content_array::<32>(value, "key value")?))
}

/// Parse a bundle-fetch response into per-device prekey bundles.
pub fn parse_pre_key_bundles(resp: &Node) -> Result<Vec<(Jid, PreKeyBundle)>, BinaryError> {
    let list = resp
        .get_child_by_tag("list")
        .ok_or_else(|| BinaryError::MalformedFrame("bundle response without list".into()))?;
    let mut out = Vec::new();
    for user in list.get_children_by_tag("user") {
        let jid: Jid = user
            .attr("jid")
            .and_then(|j| j.parse().ok())
            .ok_or_else(|| BinaryError::MalformedFrame("bundle user without jid".into()))?;
        let registration_id = user
            .get_child_by_tag("registration")
            .and_then(|n| n.content_bytes())
            .and_then(|b| <[u8; 4]>::try_from(b).ok())
            .map(u32::from_be_bytes)
            .ok_or_else(|| BinaryError::MalformedFrame("bundle without registration".into()))?;
        let identity = user
            .get_child_by_tag("identity")
            .ok_or_else(|| BinaryError::MalformedFrame("bundle without identity".into()))?;
        let identity_key = content_array::<32>(identity, "identity")?;
        let skey = user
            .get_child_by_tag("skey")
            .ok_or_else(|| BinaryError::MalformedFrame("bundle without skey".into()))?;
        let (signed_pre_key_id, signed_pre_key_public) = parse_key_pair_node(skey)?;
        let signature = skey
            .get_child_by_tag("signature")
            .ok_or_else(|| BinaryError::MalformedFrame("skey without signature".into()))?;
        let signed_pre_key_signature = content_array::<64>(signature, "skey signature")?;
        let pre_key = user
            .get_child_by_tag("key")
            .map(parse_key_pair_node)
            .transpose()?;

        out.push((
            jid,
            PreKeyBundle {
                registration_id,
                identity_key,
                signed_pre_key_id,
                signed_pre_key_public,
                signed_pre_key_signature,
                pre_key,
            },
        ));
    }
    Ok(out)
}

/// Parse a bundle-fetch response and build a session for every device in
/// it.
pub async fn parse_and_inject_e2e_sessions(
    resp: &Node,
    repo: &SignalRepository,
) -> crate::Result<()> {
    for (jid, bundle) in parse_pre_key_bundles(resp)? {
        repo.inject_e2e_session(&jid, bundle).await?;
    }
    Ok(())
}

/// Build the response-shaped user node for one bundle (used by tests and
/// the pairing flow's own-bundle upload echo).
pub fn bundle_user_node(jid: &Jid, bundle: &PreKeyBundle) -> Node {
    let mut children = vec![
        Node::new("registration").with_content(bundle.registration_id.to_be_bytes().to_vec()),
        Node::new("identity").with_content(bundle.identity_key.to_vec()),
        Node::new("skey").with_children(vec![
            Node::new("id").with_content(id_bytes(bundle.signed_pre_key_id)),
            Node::new("value").with_content(bundle.signed_pre_key_public.to_vec()),
            Node::new("signature").with_content(bundle.signed_pre_key_signature.to_vec()),
        ]),
    ];
    if let Some((id, public)) = &bundle.pre_key {
        children.push(key_node(*id, public));
    }
    Node::new("user")
        .with_attr("jid", jid.to_string())
        .with_children(children)
}
