use crate::error::CoreError;
use crate::time::now_ms;
use crate::wrapper::{ConfigMergeInput, ConfigNamespace, ConfigWrappers};
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IncomingConfigEnvelope {
    pub namespace: ConfigNamespace,
    pub payload: Vec<u8>,
    pub message_hash: String,
    pub envelope_timestamp: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeOutcome {
    pub namespace: ConfigNamespace,
    pub needs_push: bool,
    pub needs_dump: bool,
    pub latest_envelope_timestamp: u64,
    pub owner_key: String,
}

/// Groups envelopes by namespace, keeping arrival order inside each group.
pub fn group_by_namespace(
    envelopes: Vec<IncomingConfigEnvelope>,
) -> BTreeMap<ConfigNamespace, Vec<IncomingConfigEnvelope>> {
    let mut grouped: BTreeMap<ConfigNamespace, Vec<IncomingConfigEnvelope>> = BTreeMap::new();
    for envelope in envelopes {
        grouped.entry(envelope.namespace).or_default().push(envelope);
    }
    grouped
}

fn latest_timestamp(group: &[IncomingConfigEnvelope]) -> u64 {
    group
        .iter()
        .map(|e| e.envelope_timestamp)
        .max()
        .unwrap_or_else(now_ms)
}

/// Feeds one batch into the wrappers, one merge call per namespace.
///
/// The batch is all or nothing: if any namespace fails, every namespace
/// already merged in this batch is rolled back to its pre-batch snapshot
/// and the error is returned. The batch guard is held throughout, so other
/// batches and local edits wait until the batch committed or rolled back.
pub async fn merge_incoming(
    wrappers: &dyn ConfigWrappers,
    owner_key: &str,
    envelopes: Vec<IncomingConfigEnvelope>,
) -> Result<BTreeMap<ConfigNamespace, MergeOutcome>, CoreError> {
    let grouped = group_by_namespace(envelopes);
    let _batch = wrappers.begin_batch().await;
    let mut snapshots: Vec<(ConfigNamespace, Vec<u8>)> = Vec::with_capacity(grouped.len());
    let mut outcomes = BTreeMap::new();

    for (namespace, group) in grouped {
        if group.is_empty() {
            continue;
        }
        let result = merge_namespace(wrappers, namespace, &group, &mut snapshots).await;
        match result {
            Ok((needs_push, needs_dump)) => {
                log::info!(
                    "merged {} {} messages: needsPush:{} needsDump:{}",
                    group.len(),
                    namespace.as_str(),
                    needs_push,
                    needs_dump
                );
                outcomes.insert(
                    namespace,
                    MergeOutcome {
                        namespace,
                        needs_push,
                        needs_dump,
                        latest_envelope_timestamp: latest_timestamp(&group),
                        owner_key: owner_key.to_string(),
                    },
                );
            }
            Err(e) => {
                log::error!("merge of {} failed, dropping batch: {}", namespace.as_str(), e);
                rollback(wrappers, &snapshots).await;
                return Err(match e {
                    CoreError::MergePrimitive(reason) => CoreError::MergePrimitive(reason),
                    other => CoreError::MergePrimitive(other.to_string()),
                });
            }
        }
    }
    Ok(outcomes)
}

async fn merge_namespace(
    wrappers: &dyn ConfigWrappers,
    namespace: ConfigNamespace,
    group: &[IncomingConfigEnvelope],
    snapshots: &mut Vec<(ConfigNamespace, Vec<u8>)>,
) -> Result<(bool, bool), CoreError> {
    let snapshot = wrappers.snapshot(namespace).await?;
    snapshots.push((namespace, snapshot));
    let inputs = group
        .iter()
        .map(|e| ConfigMergeInput {
            data: e.payload.clone(),
            hash: e.message_hash.clone(),
        })
        .collect();
    wrappers.merge(namespace, inputs).await?;
    let needs_push = wrappers.needs_push(namespace).await?;
    let needs_dump = wrappers.needs_dump(namespace).await?;
    Ok((needs_push, needs_dump))
}

async fn rollback(wrappers: &dyn ConfigWrappers, snapshots: &[(ConfigNamespace, Vec<u8>)]) {
    for (namespace, snapshot) in snapshots.iter().rev() {
        if let Err(e) = wrappers.restore(*namespace, snapshot).await {
            log::error!("restoring {} after failed batch: {}", namespace.as_str(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(namespace: ConfigNamespace, hash: &str, ts: u64) -> IncomingConfigEnvelope {
        IncomingConfigEnvelope {
            namespace,
            payload: Vec::new(),
            message_hash: hash.to_string(),
            envelope_timestamp: ts,
        }
    }

    #[test]
    fn grouping_keeps_arrival_order() {
        let grouped = group_by_namespace(vec![
            envelope(ConfigNamespace::Contacts, "c2", 5),
            envelope(ConfigNamespace::UserProfile, "p1", 9),
            envelope(ConfigNamespace::Contacts, "c1", 3),
        ]);
        let contacts: Vec<&str> = grouped[&ConfigNamespace::Contacts]
            .iter()
            .map(|e| e.message_hash.as_str())
            .collect();
        assert_eq!(contacts, vec!["c2", "c1"]);
        assert_eq!(latest_timestamp(&grouped[&ConfigNamespace::Contacts]), 5);
        assert!(!grouped.contains_key(&ConfigNamespace::UserGroups));
    }
}
