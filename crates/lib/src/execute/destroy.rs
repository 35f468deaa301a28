//! Tearing down everything a session recorded.

use std::sync::atomic::AtomicU64;

use tokio::sync::Mutex;
use tracing::info;

use crate::runtime::RuntimeClient;

use super::dag::ResourceDag;
use super::types::{ReconcileError, ReconciliationReport};
use super::{Reconciler, Shared, remove_in_order};

impl<R: RuntimeClient> Reconciler<R> {
  /// Remove every recorded resource in reverse dependency order.
  ///
  /// Each record is tombstoned right after its removal. Destroying a session with no
  /// records makes no runtime calls.
  pub async fn destroy(&self) -> Result<ReconciliationReport, ReconcileError> {
    self.ensure_writable().await?;

    let records = self.records().await;
    let mut report = ReconciliationReport::new(&self.session);
    if records.is_empty() {
      info!(session = %self.session, "nothing recorded, nothing to destroy");
      return Ok(report);
    }

    let order = ResourceDag::from_records(&records)?.deletion_order();
    info!(session = %self.session, resources = order.len(), "destroying session resources");

    let shared = Shared {
      runtime: self.runtime.clone(),
      store: self.store.clone(),
      session: self.session.clone(),
      seq: AtomicU64::new(0),
      displaced: Mutex::new(Default::default()),
      stop: self.stop(),
    };
    remove_in_order(&shared, &records, &order, &mut report).await;

    report.sort();
    info!(
      deleted = report.deleted.len(),
      failed = report.failed.len(),
      skipped = report.skipped.len(),
      "destroy complete"
    );
    Ok(report)
  }
}
