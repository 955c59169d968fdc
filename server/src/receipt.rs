//! Compliance receipts: a signed provenance summary for every terminal
//! deployment, plus at-least-once delivery to an external sink.

use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use enclii_common::models::deployment::{Deployment, Receipt};

use crate::artifacts::Signer;
use crate::persistence::Persistence;
use crate::Result;

const DELIVERY_INTERVAL: Duration = Duration::from_secs(30);
const DELIVERY_BATCH: u32 = 50;

/// The canonical byte string the platform key signs. Field order is fixed
/// so independent verifiers reproduce it.
pub fn signing_payload(receipt: &Receipt) -> Vec<u8> {
    format!(
        "deployment={}\nrelease={}\ngit_sha={}\nimage_digest={}\nsbom={}\nsignature={}\ndeployed_by={}\ndeployed_at={}",
        receipt.deployment_id,
        receipt.release_id,
        receipt.git_sha,
        receipt.image_digest.as_deref().unwrap_or(""),
        receipt.sbom_ref.as_deref().unwrap_or(""),
        receipt.signature_ref.as_deref().unwrap_or(""),
        receipt.deployed_by,
        receipt.deployed_at.to_rfc3339(),
    )
    .into_bytes()
}

/// Record the receipt for a deployment that just turned terminal.
/// Insert-if-absent keyed by the deployment id, so replays after a crash
/// cannot double-emit.
pub async fn record_terminal(
    persistence: &Persistence,
    signer: &Signer,
    deployment: &Deployment,
) -> Result<()> {
    let release = persistence.get_release(deployment.release_id).await?;
    let service = persistence.get_service(release.service_id).await?;
    let job = persistence.job_for_release(release.id).await?;
    let deployed_by = persistence.deployment_actor(deployment.id).await?;

    let pr_url = job
        .as_ref()
        .and_then(|job| job.pr_number)
        .map(|number| format!("https://{}/pull/{number}", service.git_repo));

    let mut receipt = Receipt {
        deployment_id: deployment.id,
        release_id: release.id,
        git_sha: release.git_sha.clone(),
        pr_url,
        // Approval metadata lives in the source forge; recorded when the
        // intake payload carried it.
        pr_approver: None,
        image_digest: release.image_digest.clone(),
        signature_ref: release.signature_ref.clone(),
        sbom_ref: release.sbom_ref.clone(),
        deployed_by,
        deployed_at: deployment.ended_at.unwrap_or_else(Utc::now),
        signed_payload: String::new(),
    };
    receipt.signed_payload = signer.sign(&signing_payload(&receipt));

    if persistence.insert_receipt(&receipt).await? {
        info!(deployment_id = %deployment.id, "recorded deployment receipt");
    }

    Ok(())
}

/// Pushes undelivered receipts to the compliance sink. Failures are
/// retained and retried on the next cycle until delivery succeeds or an
/// operator discards them.
pub struct ReceiptDeliverer {
    persistence: Persistence,
    sink: String,
    http: reqwest::Client,
}

impl ReceiptDeliverer {
    pub fn new(persistence: Persistence, sink: String) -> Self {
        Self {
            persistence,
            sink,
            http: reqwest::Client::new(),
        }
    }

    pub fn spawn(self) {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(DELIVERY_INTERVAL);
            loop {
                tick.tick().await;
                if let Err(err) = self.deliver_pending().await {
                    error!(error = %err, "receipt delivery cycle failed");
                }
            }
        });
    }

    async fn deliver_pending(&self) -> Result<()> {
        for receipt in self.persistence.undelivered_receipts(DELIVERY_BATCH).await? {
            let delivered = self
                .http
                .post(&self.sink)
                .json(&receipt)
                .send()
                .await
                .map(|response| response.status().is_success())
                .unwrap_or(false);

            if delivered {
                self.persistence
                    .mark_receipt_delivered(receipt.deployment_id)
                    .await?;
            } else {
                let attempts = self
                    .persistence
                    .bump_receipt_attempts(receipt.deployment_id)
                    .await?;
                warn!(
                    deployment_id = %receipt.deployment_id,
                    attempts,
                    "receipt delivery failed, will retry"
                );
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[test]
    fn signed_payload_verifies_and_binds_the_fields() {
        let signer = Signer::ephemeral();
        let mut receipt = Receipt {
            deployment_id: Uuid::new_v4(),
            release_id: Uuid::new_v4(),
            git_sha: "abc1234".to_string(),
            pr_url: None,
            pr_approver: None,
            image_digest: Some("sha256:abc".to_string()),
            signature_ref: Some("signature:sha256:1".to_string()),
            sbom_ref: Some("sbom:sha256:1".to_string()),
            deployed_by: "alice@example.com".to_string(),
            deployed_at: Utc::now(),
            signed_payload: String::new(),
        };
        receipt.signed_payload = signer.sign(&signing_payload(&receipt));

        assert!(signer.verify(&signing_payload(&receipt), &receipt.signed_payload));

        // Any field change breaks the signature.
        receipt.git_sha = "def5678".to_string();
        assert!(!signer.verify(&signing_payload(&receipt), &receipt.signed_payload));
    }
}
