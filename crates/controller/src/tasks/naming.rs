//! Deterministic names for owned sub-resources.
//!
//! Every name is derived from the owner's name and the sub-resource's role so
//! that repeated reconciles address the same objects.

const MAX_DNS_LABEL_LENGTH: usize = 63;
const HASH_LENGTH: usize = 8;

pub struct ResourceNaming;

impl ResourceNaming {
    /// Application Deployment, Service and Ingress share the owner's name
    #[must_use]
    pub fn app(owner: &str) -> String {
        Self::label_of(owner, MAX_DNS_LABEL_LENGTH)
    }

    /// Deployment and Service of a dependency: `<owner>-<dependency>`
    #[must_use]
    pub fn dependency(owner: &str, dependency: &str) -> String {
        Self::label_of(&format!("{owner}-{dependency}"), MAX_DNS_LABEL_LENGTH)
    }

    /// Credential secret of a dependency
    #[must_use]
    pub fn dependency_secret(owner: &str, dependency: &str) -> String {
        let base = Self::dependency(owner, dependency);
        Self::with_suffix(&base, "-credentials")
    }

    /// Runner Deployment, Role and RoleBinding of a pool
    #[must_use]
    pub fn runner(pool: &str) -> String {
        let suffix = "-runner";
        let base = Self::label_of(pool, MAX_DNS_LABEL_LENGTH - suffix.len());
        format!("{base}{suffix}")
    }

    /// Append `suffix`, shortening the base (with a hash) when the result would be too long
    #[must_use]
    pub fn with_suffix(base: &str, suffix: &str) -> String {
        let available = MAX_DNS_LABEL_LENGTH.saturating_sub(suffix.len());
        let trimmed = Self::ensure_k8s_name_length(base, available);
        format!("{trimmed}{suffix}")
    }

    /// Lowercase RFC 1123 label: alphanumerics and '-', no leading/trailing '-'
    #[must_use]
    pub fn dns_label(input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        let mut last_dash = false;
        for c in input.chars() {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() {
                out.push(c);
                last_dash = false;
            } else if !last_dash {
                out.push('-');
                last_dash = true;
            }
        }
        out.trim_matches('-').to_string()
    }

    /// Whether `name` is already a valid RFC 1123 label
    #[must_use]
    pub fn is_dns_label(name: &str) -> bool {
        !name.is_empty() && name.len() <= MAX_DNS_LABEL_LENGTH && Self::dns_label(name) == name
    }

    /// `input` as a label of at most `limit` characters. Inputs that had to
    /// be rewritten carry a hash of the original so `shop.v1` and `shop-v1`
    /// stay apart.
    fn label_of(input: &str, limit: usize) -> String {
        let label = Self::dns_label(input);
        if label == input {
            return Self::ensure_k8s_name_length(&label, limit);
        }
        let hash = Self::hash_string(input);
        let keep = limit.saturating_sub(HASH_LENGTH + 1);
        let prefix = label[..label.len().min(keep)].trim_end_matches('-');
        if prefix.is_empty() {
            hash
        } else {
            format!("{prefix}-{hash}")
        }
    }

    fn ensure_k8s_name_length(name: &str, limit: usize) -> String {
        if name.len() <= limit {
            return name.to_string();
        }
        // Keep a readable prefix and make it unique with a hash of the full name
        let keep = limit.saturating_sub(HASH_LENGTH + 1);
        let prefix = name[..keep].trim_end_matches('-');
        format!("{prefix}-{}", Self::hash_string(name))
    }

    /// FNV-1a, stable across toolchains so names survive controller upgrades
    fn hash_string(input: &str) -> String {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in input.bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        format!("{hash:016x}")[..HASH_LENGTH].to_string()
    }
}
