/// Cold-start backfill from the upstream repository server
///
/// Walks `com.atproto.sync.listRepos`, then every indexed collection of
/// every active repo via `com.atproto.repo.listRecords`, and writes the
/// records through the same typed dispatch as the live firehose path.
/// Writes are grouped into chunked transactions for throughput only.
///
/// Progress is kept per repo, so a run that is interrupted or leaves repos
/// unfinished is resumed by the next one without walking finished repos again.
use crate::{
    config::AppViewConfig,
    error::AppViewResult,
    firehose::IngestStatus,
    metrics,
    records::{parse_at_uri, Collection, Record},
    store::{RecordWrite, Store},
};
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LIST_REPOS_LIMIT: u32 = 1000;

/// Passes over the failed repos within one run
const REPO_ATTEMPTS: u32 = 3;

#[derive(Debug, Deserialize)]
struct ListReposResponse {
    cursor: Option<String>,
    #[serde(default)]
    repos: Vec<RepoEntry>,
}

#[derive(Debug, Deserialize)]
struct RepoEntry {
    did: String,
    active: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct DescribeRepoResponse {
    handle: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListRecordsResponse {
    cursor: Option<String>,
    #[serde(default)]
    records: Vec<RecordEntry>,
}

#[derive(Debug, Deserialize)]
struct RecordEntry {
    uri: String,
    cid: String,
    value: Value,
}

/// Totals from one backfill run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillReport {
    /// Repos walked to completion in this run
    pub repos: usize,
    /// Records written
    pub records: usize,
    /// Records rejected or failed to write
    pub failed: usize,
    /// Inactive repos
    pub skipped_repos: usize,
    /// Repos already finished by an earlier run
    pub resumed_repos: usize,
    /// Repos still failing after every attempt
    pub unfinished_repos: usize,
}

impl BackfillReport {
    /// True when every active repo has been walked
    pub fn is_complete(&self) -> bool {
        self.unfinished_repos == 0
    }
}

pub struct Backfill {
    http: Client,
    base_url: String,
    store: Store,
    status: Arc<IngestStatus>,
    page_size: u32,
    batch_size: usize,
    retry_delay: Duration,
}

impl Backfill {
    pub fn new(config: &AppViewConfig, store: Store, status: Arc<IngestStatus>) -> AppViewResult<Self> {
        let http = Client::builder().timeout(Duration::from_secs(30)).build()?;

        Ok(Self {
            http,
            base_url: config.pds_http_url(),
            store,
            status,
            page_size: config.backfill.page_size,
            batch_size: config.backfill.batch_size.max(1),
            retry_delay: Duration::from_secs(5),
        })
    }

    /// Run a backfill, marking the index complete only if every repo finished
    ///
    /// An error listing repos aborts the run. A repo that keeps failing is
    /// left unfinished and reported; the next run picks it up again.
    pub async fn run(&self) -> AppViewResult<BackfillReport> {
        info!(upstream = %self.base_url, "Starting backfill");
        self.status.set_backfilling(true);
        let result = self.walk().await;
        self.status.set_backfilling(false);
        let report = result?;

        if report.is_complete() {
            self.store.mark_backfill_complete().await?;
            info!(
                repos = report.repos,
                resumed_repos = report.resumed_repos,
                records = report.records,
                failed = report.failed,
                skipped_repos = report.skipped_repos,
                "Backfill complete"
            );
        } else {
            error!(
                repos = report.repos,
                unfinished_repos = report.unfinished_repos,
                records = report.records,
                "Backfill incomplete; unfinished repos are retried on the next start"
            );
        }
        Ok(report)
    }

    async fn walk(&self) -> AppViewResult<BackfillReport> {
        let mut report = BackfillReport::default();
        let done = self.store.backfilled_repos().await?;

        let mut pending: Vec<String> = Vec::new();
        for did in self.list_repos(&mut report).await? {
            if done.contains(&did) {
                report.resumed_repos += 1;
            } else {
                pending.push(did);
            }
        }
        if report.resumed_repos > 0 {
            info!(resumed_repos = report.resumed_repos, "Resuming earlier backfill");
        }

        for attempt in 1..=REPO_ATTEMPTS {
            if pending.is_empty() {
                break;
            }
            if attempt > 1 {
                warn!(repos = pending.len(), attempt, "Retrying failed repos");
                tokio::time::sleep(self.retry_delay * (attempt - 1)).await;
            }

            let mut failed = Vec::new();
            for did in pending {
                match self.backfill_repo(&did, &mut report).await {
                    Ok(()) => {
                        self.store.mark_repo_backfilled(&did).await?;
                        self.status.record_backfilled_repo();
                        report.repos += 1;
                    }
                    Err(e) => {
                        warn!(did = %did, attempt, error = %e, "Failed to backfill repo");
                        failed.push(did);
                    }
                }
            }
            pending = failed;
        }

        for did in &pending {
            error!(did = %did, "Giving up on repo for this run");
        }
        report.unfinished_repos = pending.len();
        Ok(report)
    }

    /// Every active DID, across all listRepos pages
    async fn list_repos(&self, report: &mut BackfillReport) -> AppViewResult<Vec<String>> {
        let mut dids = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut params = vec![("limit", LIST_REPOS_LIMIT.to_string())];
            if let Some(c) = &cursor {
                params.push(("cursor", c.clone()));
            }
            let page: ListReposResponse = self.get("com.atproto.sync.listRepos", &params).await?;

            for repo in &page.repos {
                if repo.active == Some(false) {
                    debug!(did = %repo.did, "Skipping inactive repo");
                    report.skipped_repos += 1;
                } else {
                    dids.push(repo.did.clone());
                }
            }

            match page.cursor {
                Some(next) if !page.repos.is_empty() && cursor.as_ref() != Some(&next) => {
                    cursor = Some(next)
                }
                _ => break,
            }
        }

        Ok(dids)
    }

    async fn backfill_repo(&self, did: &str, report: &mut BackfillReport) -> AppViewResult<()> {
        // Handles are not part of any record, so fetch them separately
        match self
            .get::<DescribeRepoResponse>("com.atproto.repo.describeRepo", &[("repo", did.to_string())])
            .await
        {
            Ok(DescribeRepoResponse {
                handle: Some(handle),
            }) => self.store.set_handle(did, &handle).await?,
            Ok(_) => {}
            Err(e) => warn!(did = %did, error = %e, "describeRepo failed; continuing without handle"),
        }

        for collection in Collection::ALL {
            let mut pending: Vec<RecordWrite> = Vec::with_capacity(self.batch_size);
            let walked = self.walk_collection(did, collection, &mut pending, report).await;
            // Pages fetched before a failure are still written
            self.flush(collection, &mut pending, report).await?;
            walked?;
        }

        debug!(did = %did, "Repo backfilled");
        Ok(())
    }

    async fn walk_collection(
        &self,
        did: &str,
        collection: Collection,
        pending: &mut Vec<RecordWrite>,
        report: &mut BackfillReport,
    ) -> AppViewResult<()> {
        let mut cursor: Option<String> = None;
        loop {
            let mut params = vec![
                ("repo", did.to_string()),
                ("collection", collection.nsid().to_string()),
                ("limit", self.page_size.to_string()),
            ];
            if let Some(c) = &cursor {
                params.push(("cursor", c.clone()));
            }
            let page: ListRecordsResponse = self.get("com.atproto.repo.listRecords", &params).await?;

            for entry in &page.records {
                match to_write(did, collection, entry) {
                    Some(write) => pending.push(write),
                    None => report.failed += 1,
                }
                if pending.len() >= self.batch_size {
                    self.flush(collection, pending, report).await?;
                }
            }

            match page.cursor {
                Some(next) if !page.records.is_empty() && cursor.as_ref() != Some(&next) => {
                    cursor = Some(next)
                }
                _ => return Ok(()),
            }
        }
    }

    /// Write one collection's pending records in a single transaction
    async fn flush(
        &self,
        collection: Collection,
        pending: &mut Vec<RecordWrite>,
        report: &mut BackfillReport,
    ) -> AppViewResult<()> {
        if pending.is_empty() {
            return Ok(());
        }

        let outcome = self.store.apply_batch(pending).await?;
        report.records += outcome.applied;
        report.failed += outcome.failed;
        metrics::record_backfill_records(collection.label(), outcome.applied);

        pending.clear();
        Ok(())
    }

    async fn get<T: DeserializeOwned>(&self, nsid: &str, params: &[(&str, String)]) -> AppViewResult<T> {
        let url = format!("{}/xrpc/{}", self.base_url, nsid);
        let response = self
            .http
            .get(&url)
            .query(params)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<T>().await?)
    }
}

/// Type a listed record; `None` when its uri or body is unusable
fn to_write(did: &str, collection: Collection, entry: &RecordEntry) -> Option<RecordWrite> {
    let Some((uri_did, _, rkey)) = parse_at_uri(&entry.uri) else {
        warn!(uri = %entry.uri, "Listed record has a malformed uri");
        return None;
    };
    if uri_did != did {
        warn!(uri = %entry.uri, repo = %did, "Listed record belongs to another repo");
        return None;
    }

    match Record::from_value(collection, entry.value.clone()) {
        Ok(record) => Some(RecordWrite {
            did: did.to_string(),
            rkey: rkey.to_string(),
            cid: entry.cid.clone(),
            record,
        }),
        Err(e) => {
            warn!(uri = %entry.uri, error = %e, "Rejecting listed record");
            None
        }
    }
}
