use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::LazyLock;

use chrono::Utc;
use k8s_openapi::api::admissionregistration::v1::ValidatingWebhookConfiguration;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{Resource, ResourceExt};
use regex::Regex;

/// Webhook configurations that istiod itself keeps patching (caBundle, failurePolicy).
static VALIDATOR_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new("istiod-.*-validator|istio-validator.*").expect("validator name regex is valid")
});

fn is_istiod_validator(name: &str) -> bool {
    VALIDATOR_NAME.is_match(name)
}

/// Strip the fields istiod and the apiserver churn on the validator webhook configurations.
fn clear_ignored_fields(config: &mut ValidatingWebhookConfiguration) {
    let meta = config.meta_mut();
    meta.resource_version = None;
    meta.generation = None;
    meta.managed_fields = None;
    for webhook in config.webhooks.iter_mut().flatten() {
        webhook.failure_policy = None;
    }
}

/// Watch stream predicate for ValidatingWebhookConfigurations: an object is only passed on when
/// its hash differs from the last one seen.
///
/// Updates to istiod's own validators only count when something other than the fields istiod
/// rewrites has changed. Every other update counts.
pub(super) fn validating_webhook_predicate(config: &ValidatingWebhookConfiguration) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    if is_istiod_validator(&config.name_any()) {
        let mut config = config.clone();
        clear_ignored_fields(&mut config);
        serde_hashkey::to_key(&config)
            .expect("serde_hashkey never to return an error")
            .hash(&mut hasher);
    } else {
        // any write moves the resourceVersion
        config.resource_version().hash(&mut hasher);
    }
    Some(hasher.finish())
}

// deletion does not otherwise change the object, so the predicate would drop it
pub(super) fn ensure_deletion_change<K: Resource, E>(
    mut event: Result<kube::runtime::watcher::Event<K>, E>,
) -> Result<kube::runtime::watcher::Event<K>, E> {
    if let Ok(kube::runtime::watcher::Event::Delete(ref mut object)) = event {
        let meta = object.meta_mut();
        meta.deletion_timestamp = Some(Time(Utc::now()));
        meta.resource_version = None;
    }
    event
}
