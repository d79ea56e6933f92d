//! Dependency credentials: generated once, then always read back from the Secret

use super::{CredentialValue, DependencyProfile};
use k8s_openapi::api::core::v1::Secret;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::BTreeMap;

/// Produces new secret values
pub trait CredentialSource: Send + Sync {
    fn generate(&self, length: usize) -> String;
}

/// Alphanumeric values from the thread-local RNG (safe inside connection URLs)
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomCredentials;

impl CredentialSource for RandomCredentials {
    fn generate(&self, length: usize) -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(length)
            .map(char::from)
            .collect()
    }
}

/// Credential fields for a dependency.
///
/// Values already stored in `existing` are reused verbatim; only missing keys
/// are filled from the table, generating where the table asks for it.
#[must_use]
pub fn resolve_credentials(
    profile: &DependencyProfile,
    existing: Option<&Secret>,
    source: &dyn CredentialSource,
) -> BTreeMap<String, String> {
    let stored = existing.map(secret_values).unwrap_or_default();

    profile
        .credentials
        .iter()
        .map(|field| {
            let value = match stored.get(field.key) {
                Some(value) if !value.is_empty() => value.clone(),
                _ => match field.value {
                    CredentialValue::Fixed(v) => v.to_string(),
                    CredentialValue::Generated(len) => source.generate(len),
                },
            };
            (field.key.to_string(), value)
        })
        .collect()
}

/// Decoded `data` (and any `stringData`) of a Secret
#[must_use]
pub fn secret_values(secret: &Secret) -> BTreeMap<String, String> {
    let mut values: BTreeMap<String, String> = secret
        .data
        .iter()
        .flatten()
        .filter_map(|(k, v)| String::from_utf8(v.0.clone()).ok().map(|s| (k.clone(), s)))
        .collect();
    if let Some(string_data) = &secret.string_data {
        for (k, v) in string_data {
            values.insert(k.clone(), v.clone());
        }
    }
    values
}

#[cfg(test)]
pub mod testing {
    use super::CredentialSource;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Deterministic values: `generated-1`, `generated-2`, ...
    #[derive(Debug, Default)]
    pub struct SequentialCredentials {
        counter: AtomicUsize,
    }

    impl SequentialCredentials {
        pub fn issued(&self) -> usize {
            self.counter.load(Ordering::SeqCst)
        }
    }

    impl CredentialSource for SequentialCredentials {
        fn generate(&self, _length: usize) -> String {
            let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
            format!("generated{n}")
        }
    }
}
