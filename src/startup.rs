//! One-time node preparation before the controller loop starts
//!
//! Recovery always runs so the prepared set reflects the cards. Discovery runs
//! until the record is marked processed; the catalog never changes after that.

use tracing::{info, instrument};

use crate::capacity::sync_capacity_labels;
use crate::controller::Context;
use crate::crd::{MigNode, MigNodeSpec};
use crate::discovery::discover_placements;
use crate::recovery::{merge_recovered, recover_existing_partitions};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::Error;

/// Discover, recover and write the node record.
///
/// Hardware errors are fatal; cluster errors are retried with backoff first.
#[instrument(skip(ctx), fields(node = %ctx.config.node_name))]
pub async fn prepare_node(ctx: &Context, retry: &RetryConfig) -> Result<MigNode, Error> {
    let name = ctx.config.node_name.as_str();
    let recovered = recover_existing_partitions(ctx.backend.as_ref())?;
    info!(partitions = recovered.len(), "recovered existing partitions");

    let existing = retry_with_backoff(retry, "get_record", || ctx.client.get_record(name)).await?;
    let processed = existing
        .as_ref()
        .and_then(|r| r.status.as_ref())
        .is_some_and(|s| s.is_processed());

    let record = match existing {
        None => {
            let mut spec = MigNodeSpec::default();
            discover_placements(ctx.backend.as_ref())?.apply_to(&mut spec);
            merge_recovered(&mut spec, recovered);
            let mut record = MigNode::new(name, spec);
            record.metadata.namespace = Some(ctx.config.namespace.clone());
            let created =
                retry_with_backoff(retry, "create_record", || ctx.client.create_record(&record))
                    .await?;
            info!("created node record");
            created
        }
        Some(mut record) => {
            if !processed {
                discover_placements(ctx.backend.as_ref())?.apply_to(&mut record.spec);
            }
            merge_recovered(&mut record.spec, recovered);
            retry_with_backoff(retry, "replace_record", || ctx.client.replace_record(&record))
                .await?
        }
    };

    if !processed {
        retry_with_backoff(retry, "mark_processed", || ctx.client.mark_processed(name)).await?;
        info!(
            profiles = record.spec.mig_placement.len(),
            gpus = record.spec.mig_gpu_uuid.len(),
            "published placement catalog"
        );
    }

    retry_with_backoff(retry, "sync_capacity_labels", || {
        sync_capacity_labels(ctx.client.as_ref(), &ctx.config, record.spec.prepared.len())
    })
    .await?;

    Ok(record)
}
