use crate::{Error, Result};
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use futures::future::{BoxFuture, FutureExt, Shared};
use hkdf::Hkdf;
use serde_json::Value;
use sha2::Sha256;
use std::future::Future;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn kdf(input1: &[u8], input2: &[u8], num_outputs: usize) -> Vec<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(Some(input2), input1);

    let mut outputs = Vec::with_capacity(num_outputs);
    for i in 1..=num_outputs {
        let mut okm = [0u8; 32];
        hk.expand(&[i as u8], &mut okm)
            .expect("32 bytes is valid length");
        outputs.push(okm);
    }
    outputs
}

/// Unpadded standard base64, the encoding used for every key and signature.
pub fn encode_base64(bytes: impl AsRef<[u8]>) -> String {
    STANDARD_NO_PAD.encode(bytes)
}

pub fn decode_base64(input: &str) -> Result<Vec<u8>> {
    Ok(STANDARD_NO_PAD.decode(input.trim_end_matches('='))?)
}

pub fn decode_key(input: &str) -> Result<[u8; 32]> {
    let bytes = decode_base64(input)?;
    bytes
        .try_into()
        .map_err(|_| Error::Serialization("key must be 32 bytes".to_string()))
}

/// Canonical form of a signed JSON object: `signatures` and `unsigned` removed,
/// keys sorted, no insignificant whitespace.
///
/// `serde_json::Map` is ordered by key unless `preserve_order` is enabled, so
/// plain serialization already yields sorted output.
pub fn canonical_json(value: &Value) -> Result<String> {
    let Value::Object(map) = value else {
        return Err(Error::Serialization(
            "only JSON objects can be signed".to_string(),
        ));
    };

    let mut map = map.clone();
    map.remove("signatures");
    map.remove("unsigned");
    Ok(serde_json::to_string(&Value::Object(map))?)
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub(crate) type SharedResult<T> = Shared<BoxFuture<'static, Result<T>>>;

/// Run `future` on its own task and return a handle any number of callers can
/// await. Dropping every handle does not cancel the task.
pub(crate) fn spawn_shared<T, F>(future: F) -> SharedResult<T>
where
    T: Clone + Send + Sync + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    let task = tokio::spawn(future);
    async move {
        match task.await {
            Ok(result) => result,
            Err(e) => Err(Error::Engine(format!("background task failed: {e}"))),
        }
    }
    .boxed()
    .shared()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys_and_strips_signatures() {
        let value = json!({
            "z": 1,
            "a": {"y": true, "b": null},
            "signatures": {"@a:x": {"ed25519:D": "sig"}},
            "unsigned": {"device_display_name": "phone"},
        });

        assert_eq!(
            canonical_json(&value).unwrap(),
            r#"{"a":{"b":null,"y":true},"z":1}"#
        );
    }

    #[test]
    fn canonical_json_rejects_non_objects() {
        assert!(canonical_json(&json!([1, 2])).is_err());
    }

    #[test]
    fn base64_accepts_padded_input() {
        let encoded = encode_base64([1u8, 2, 3, 4]);
        assert!(!encoded.ends_with('='));
        assert_eq!(decode_base64("AQIDBA==").unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(decode_base64(&encoded).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn kdf_outputs_are_distinct() {
        let outputs = kdf(&[7u8; 32], b"salt", 3);
        assert_eq!(outputs.len(), 3);
        assert_ne!(outputs[0], outputs[1]);
        assert_ne!(outputs[1], outputs[2]);
    }

    #[tokio::test]
    async fn shared_task_survives_dropped_waiters() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        drop(spawn_shared(async move {
            rx.await.map_err(|e| Error::Engine(e.to_string()))?;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        }));

        tx.send(()).unwrap();
        for _ in 0..100 {
            if done.load(Ordering::SeqCst) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn shared_task_result_reaches_every_waiter() {
        let shared = spawn_shared(async { Err::<u32, _>(Error::Transport("down".to_string())) });
        let (a, b) = futures::join!(shared.clone(), shared);
        assert_eq!(a, Err(Error::Transport("down".to_string())));
        assert_eq!(a, b);
    }
}
