use std::sync::Arc;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm,
    Nonce,
};
use data_model::{classify_task, JobCategory};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::{
    error::{FleetError, Result},
    node::{Node, NodeSecret},
};
use crate::metrics::FleetMetrics;

pub const NONCE_LEN: usize = 12;

/// Derives the log encryption key shared with a node agent.
pub trait KeyDerivation: Send + Sync {
    fn derive_key(&self, secret: &NodeSecret) -> [u8; 32];
}

/// Key is the SHA-256 digest of the node credential.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256KeyDerivation;

impl KeyDerivation for Sha256KeyDerivation {
    fn derive_key(&self, secret: &NodeSecret) -> [u8; 32] {
        Sha256::digest(secret.expose()).into()
    }
}

/// Receives encrypted log fragments pushed by node agents.
///
/// A fragment is `nonce || ciphertext` sealed with AES-256-GCM under the
/// node's derived key.
pub struct LogRelay {
    keys: Arc<dyn KeyDerivation>,
    metrics: Arc<FleetMetrics>,
}

impl LogRelay {
    pub fn new(keys: Arc<dyn KeyDerivation>, metrics: Arc<FleetMetrics>) -> Self {
        Self { keys, metrics }
    }

    /// Decrypts a fragment and appends it to the node's log for the task's
    /// category. Unregistered tasks are rejected before the key is derived.
    pub fn submit(&self, node: &Node, task: &str, fragment: &[u8]) -> Result<usize> {
        let Some(category) = classify_task(task) else {
            warn!(node = %node.id, task = task, "log fragment for unregistered task");
            return Err(FleetError::UnregisteredTask(task.to_string()));
        };

        let key = self.keys.derive_key(node.secret());
        let plaintext = open(&key, fragment).map_err(|reason| {
            self.metrics.decrypt_failed();
            warn!(node = %node.id, task = task, "unable to decrypt log fragment: {}", reason);
            FleetError::DecryptionFailed {
                node: node.id.to_string(),
                reason,
            }
        })?;
        let text = String::from_utf8_lossy(&plaintext);
        let lines = node.logs.append(category, task, &text);
        debug!(
            node = %node.id,
            task = task,
            category = category.as_ref(),
            lines = lines,
            "log fragment relayed"
        );
        self.metrics.log_fragment(category);
        Ok(lines)
    }
}

fn open(key: &[u8; 32], fragment: &[u8]) -> std::result::Result<Vec<u8>, String> {
    if fragment.len() <= NONCE_LEN {
        return Err("fragment is shorter than its nonce".to_string());
    }
    let (nonce, ciphertext) = fragment.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| e.to_string())?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| "authentication failed".to_string())
}

/// Agent side of [`LogRelay::submit`]: seals `plaintext` with a fresh nonce.
#[cfg(test)]
pub fn seal(key: &[u8; 32], nonce: [u8; NONCE_LEN], plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| anyhow::anyhow!(e.to_string()))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| anyhow::anyhow!("unable to encrypt log fragment"))?;
    let mut fragment = nonce.to_vec();
    fragment.extend(ciphertext);
    Ok(fragment)
}

/// Parses the category segment of a log read request.
pub fn parse_category(name: &str) -> Result<JobCategory> {
    name.parse()
        .map_err(|_| FleetError::InvalidRequest(format!("unknown log category: {}", name)))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use data_model::{test_objects::tests::TEST_MASTER, NodeKind};

    use super::*;
    use crate::fleet::node::{NodeRegistry, NodeSpec};

    #[derive(Default)]
    struct CountingKeys {
        calls: AtomicUsize,
    }

    impl KeyDerivation for CountingKeys {
        fn derive_key(&self, secret: &NodeSecret) -> [u8; 32] {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Sha256KeyDerivation.derive_key(secret)
        }
    }

    fn node() -> Arc<Node> {
        let spec = NodeSpec {
            url: TEST_MASTER.to_string(),
            name: None,
            role: Default::default(),
            secret: NodeSecret::new("agent-pass"),
        };
        NodeRegistry::default()
            .add(NodeKind::Server, &spec, None, 50)
            .unwrap()
    }

    fn fragment(secret: &str, text: &str) -> Vec<u8> {
        let key = Sha256KeyDerivation.derive_key(&NodeSecret::new(secret));
        seal(&key, rand::random(), text.as_bytes()).unwrap()
    }

    #[test]
    fn test_unregistered_task_skips_key_derivation() {
        let keys = Arc::new(CountingKeys::default());
        let relay = LogRelay::new(keys.clone(), Arc::new(FleetMetrics::new()));
        let node = node();

        let err = relay
            .submit(&node, "sqlinjection", &fragment("agent-pass", "x"))
            .unwrap_err();
        assert!(matches!(err, FleetError::UnregisteredTask(_)));
        assert_eq!(keys.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_fragments_routed_by_category() {
        let keys = Arc::new(CountingKeys::default());
        let relay = LogRelay::new(keys.clone(), Arc::new(FleetMetrics::new()));
        let node = node();

        let lines = relay
            .submit(
                &node,
                "reseedmariabackup",
                &fragment("agent-pass", "copying ibdata1\ncompleted OK!"),
            )
            .unwrap();
        assert_eq!(lines, 2);
        relay
            .submit(&node, "optimize", &fragment("agent-pass", "optimize done"))
            .unwrap();

        let stream = node.logs.tail(JobCategory::BackupStream, 10);
        assert_eq!(stream.len(), 2);
        assert_eq!(stream[1].line, "completed OK!");
        assert_eq!(stream[0].task, "reseedmariabackup");
        let tasks = node.logs.tail(JobCategory::Task, 10);
        assert_eq!(tasks.len(), 1);
        assert_eq!(keys.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_decryption_failures_are_reported() {
        let relay = LogRelay::new(Arc::new(Sha256KeyDerivation), Arc::new(FleetMetrics::new()));
        let node = node();

        let err = relay
            .submit(&node, "error", &fragment("wrong-pass", "hello"))
            .unwrap_err();
        assert!(matches!(err, FleetError::DecryptionFailed { .. }));

        let err = relay.submit(&node, "error", b"short").unwrap_err();
        assert!(matches!(err, FleetError::DecryptionFailed { .. }));
        assert!(node.logs.tail(JobCategory::Task, 10).is_empty());
    }
}
