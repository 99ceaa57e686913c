use async_trait::async_trait;
use gwtypes::GwResult;
use serde::{Deserialize, Serialize};

/// A configured source→destination replication relationship (§3, GLOSSARY
/// "Pipe"). `dest_bucket = None` means "same-named bucket in the
/// destination zone" (the common case).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipe {
    pub source_zone: String,
    pub source_bucket: String,
    pub dest_zone: String,
    pub dest_bucket: Option<String>,
    pub filter: PipeFilter,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipeFilter {
    pub prefix: Option<String>,
    pub tags: Vec<(String, String)>,
}

impl PipeFilter {
    pub fn matches(&self, key: &str, tags: &[(String, String)]) -> bool {
        if let Some(prefix) = &self.prefix {
            if !key.starts_with(prefix.as_str()) {
                return false;
            }
        }
        self.tags.iter().all(|want| tags.iter().any(|have| have == want))
    }
}

/// Resolves `(zone, bucket)` into the set of pipes that include it as a
/// source, recursively expanding fan-out hints (§4.4.5 step 1). Modeled
/// as a bidirectional lookup by `(zone, bucket)` into a handler cache
/// rather than owning references (§9 "Cyclic references").
#[async_trait]
pub trait BucketSyncPolicyResolver: Send + Sync + 'static {
    async fn resolve(&self, zone: &str, bucket: &str) -> GwResult<Vec<Pipe>>;
}

/// A static resolver driven by a fixed pipe list, sufficient for tests
/// and for deployments with no dynamic policy engine.
pub struct StaticPolicyResolver {
    pipes: Vec<Pipe>,
}

impl StaticPolicyResolver {
    pub fn new(pipes: Vec<Pipe>) -> Self {
        Self { pipes }
    }
}

#[async_trait]
impl BucketSyncPolicyResolver for StaticPolicyResolver {
    async fn resolve(&self, zone: &str, bucket: &str) -> GwResult<Vec<Pipe>> {
        Ok(self
            .pipes
            .iter()
            .filter(|p| p.source_zone == zone && p.source_bucket == bucket)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_resolver_filters_by_source() {
        let resolver = StaticPolicyResolver::new(vec![Pipe {
            source_zone: "us-east".into(),
            source_bucket: "b1".into(),
            dest_zone: "us-west".into(),
            dest_bucket: None,
            filter: PipeFilter::default(),
        }]);
        let pipes = resolver.resolve("us-east", "b1").await.unwrap();
        assert_eq!(pipes.len(), 1);
        assert!(resolver.resolve("us-east", "other").await.unwrap().is_empty());
    }

    #[test]
    fn filter_requires_all_tags_present() {
        let filter = PipeFilter {
            prefix: Some("img/".into()),
            tags: vec![("env".into(), "prod".into())],
        };
        assert!(filter.matches("img/a.png", &[("env".into(), "prod".into())]));
        assert!(!filter.matches("img/a.png", &[]));
        assert!(!filter.matches("other/a.png", &[("env".into(), "prod".into())]));
    }
}
