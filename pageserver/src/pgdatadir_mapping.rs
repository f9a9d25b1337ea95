//!
//! Commit timestamps of a timeline, stored in the key-value store next to the data.
//!
//! Every commit record stores its wall-clock timestamp under [`COMMIT_TIMESTAMP_KEY`]
//! at the LSN of the commit, so a read of that key at any LSN returns the timestamp
//! of the latest commit at or below it. This gives a mapping in both directions
//! between LSNs and commit timestamps.
//!
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use pageserver_api::key::COMMIT_TIMESTAMP_KEY;
use pageserver_api::models::LsnByTimestampKind;
use pageserver_api::value::Value;
use tracing::*;
use utils::lsn::Lsn;

use crate::tenant::timeline::{PageReconstructError, Timeline, TimelineWriter};

/// Microseconds since the Unix epoch.
pub type TimestampTz = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LsnForTimestamp {
    /// The LSN just before the first commit after the timestamp.
    Present(Lsn),
    /// Every commit happened before the timestamp. Carries the last record LSN.
    Future(Lsn),
    /// Every commit happened after the timestamp. Carries the smallest LSN which
    /// can be read on the timeline.
    Past(Lsn),
    /// No commits in the readable range. Carries the smallest readable LSN.
    NoData(Lsn),
}

impl LsnForTimestamp {
    pub fn kind(&self) -> LsnByTimestampKind {
        match self {
            LsnForTimestamp::Present(_) => LsnByTimestampKind::Present,
            LsnForTimestamp::Future(_) => LsnByTimestampKind::Future,
            LsnForTimestamp::Past(_) => LsnByTimestampKind::Past,
            LsnForTimestamp::NoData(_) => LsnByTimestampKind::NoData,
        }
    }

    pub fn lsn(&self) -> Lsn {
        match self {
            LsnForTimestamp::Present(lsn)
            | LsnForTimestamp::Future(lsn)
            | LsnForTimestamp::Past(lsn)
            | LsnForTimestamp::NoData(lsn) => *lsn,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum TimestampLookupError {
    #[error("Invalid LSN")]
    InvalidLsn,

    #[error(transparent)]
    Read(#[from] PageReconstructError),
}

pub fn to_timestamp(time: SystemTime) -> TimestampTz {
    match time.duration_since(UNIX_EPOCH) {
        Ok(since_epoch) => since_epoch.as_micros() as TimestampTz,
        Err(e) => -(e.duration().as_micros() as TimestampTz),
    }
}

pub fn from_timestamp(timestamp: TimestampTz) -> SystemTime {
    let micros = Duration::from_micros(timestamp.unsigned_abs());
    if timestamp >= 0 {
        UNIX_EPOCH + micros
    } else {
        UNIX_EPOCH - micros
    }
}

impl TimelineWriter<'_> {
    /// Records the timestamp of a commit record at `lsn`.
    pub(crate) async fn put_commit_timestamp(
        &mut self,
        lsn: Lsn,
        commit_time: SystemTime,
    ) -> anyhow::Result<()> {
        let timestamp = to_timestamp(commit_time);
        let value = Value::Image(Bytes::copy_from_slice(&timestamp.to_be_bytes()));
        self.put(COMMIT_TIMESTAMP_KEY, lsn, &value).await
    }
}

impl Timeline {
    /// Locate LSN, such that all transactions that committed before
    /// 'search_timestamp' are visible, but nothing newer is.
    ///
    /// This is not exact. Commit timestamps are not guaranteed to be ordered,
    /// so it's not possible to find the exact LSN.
    pub(crate) async fn find_lsn_for_timestamp(
        &self,
        search_timestamp: TimestampTz,
    ) -> Result<LsnForTimestamp, PageReconstructError> {
        // a branch cannot go back past its branch point
        let min_lsn = std::cmp::max(self.get_latest_gc_cutoff_lsn(), self.get_ancestor_lsn());
        let max_lsn = self.get_last_record_lsn();

        let mut low = min_lsn.0;
        let mut high = max_lsn.0 + 1;

        let mut found_smaller = false;
        let mut found_larger = false;
        while low < high {
            if self.cancel.is_cancelled() {
                return Err(PageReconstructError::Cancelled);
            }
            // cannot overflow, high and low are both at most the last record LSN + 1
            let mid = low + (high - low) / 2;

            let cmp = self
                .is_latest_commit_timestamp_gt_than(
                    search_timestamp,
                    Lsn(mid),
                    &mut found_smaller,
                    &mut found_larger,
                )
                .await?;

            if cmp {
                high = mid;
            } else {
                low = mid + 1;
            }
        }

        let res = match (found_smaller, found_larger) {
            (false, false) => LsnForTimestamp::NoData(min_lsn),
            (true, false) => LsnForTimestamp::Future(max_lsn),
            (false, true) => LsnForTimestamp::Past(min_lsn),
            // low is the first LSN with a newer commit; everything below it is visible
            (true, true) => LsnForTimestamp::Present(Lsn(low - 1)),
        };
        debug!(search_timestamp, ?res, "found lsn for timestamp");
        Ok(res)
    }

    /// Subroutine of find_lsn_for_timestamp(). Returns true, if the latest commit
    /// at 'probe_lsn' committed after 'search_timestamp'.
    ///
    /// Additionally, sets 'found_smaller'/'found_larger', if encounters any commits
    /// with a smaller/larger timestamp.
    async fn is_latest_commit_timestamp_gt_than(
        &self,
        search_timestamp: TimestampTz,
        probe_lsn: Lsn,
        found_smaller: &mut bool,
        found_larger: &mut bool,
    ) -> Result<bool, PageReconstructError> {
        match self.latest_commit_timestamp(probe_lsn).await? {
            Some(timestamp) if timestamp > search_timestamp => {
                *found_larger = true;
                Ok(true)
            }
            Some(_) => {
                *found_smaller = true;
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Timestamp of the latest commit at or below the LSN, `None` if there was none.
    async fn latest_commit_timestamp(
        &self,
        lsn: Lsn,
    ) -> Result<Option<TimestampTz>, PageReconstructError> {
        if !lsn.is_valid() {
            return Ok(None);
        }
        match self.get(COMMIT_TIMESTAMP_KEY, lsn).await {
            Ok(buf) => Ok(Some(decode_timestamp(&buf)?)),
            Err(PageReconstructError::MissingKey { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Returns the timestamp of the latest commit at or below the LSN. LSNs past the
    /// last record read at the last record.
    pub(crate) async fn get_timestamp_for_lsn(
        &self,
        probe_lsn: Lsn,
    ) -> Result<TimestampTz, TimestampLookupError> {
        if !probe_lsn.is_valid() {
            return Err(TimestampLookupError::InvalidLsn);
        }
        let lsn = std::cmp::min(probe_lsn, self.get_last_record_lsn());
        let buf = self.get(COMMIT_TIMESTAMP_KEY, lsn).await?;
        Ok(decode_timestamp(&buf)?)
    }
}

fn decode_timestamp(buf: &[u8]) -> Result<TimestampTz, PageReconstructError> {
    let bytes: [u8; 8] = buf.try_into().map_err(|_| {
        PageReconstructError::Other(anyhow::anyhow!(
            "commit timestamp value has {} bytes, expected 8",
            buf.len()
        ))
    })?;
    Ok(TimestampTz::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use pageserver_api::key::Key;
    use utils::id::TimelineId;

    use super::*;
    use crate::tenant::harness::{test_img, TenantHarness, TIMELINE_ID};

    const HOUR: Duration = Duration::from_secs(3600);

    /// Commits at 0x20, 0x30, .., one second apart, starting at `base`.
    async fn commit_sequence(
        tline: &Timeline,
        base: SystemTime,
        count: u64,
    ) -> Vec<(Lsn, SystemTime)> {
        let mut commits = Vec::new();
        let mut writer = tline.writer().await;
        for i in 0..count {
            let lsn = Lsn(0x20 + 0x10 * i);
            let time = base + Duration::from_secs(i);
            writer.put(Key::user(1, i as u32), lsn, &Value::Image(test_img("row"))).await.unwrap();
            writer.put_commit_timestamp(lsn, time).await.unwrap();
            writer.finish_write(lsn);
            commits.push((lsn, time));
        }
        commits
    }

    #[test]
    fn timestamp_conversions() {
        let t = UNIX_EPOCH + Duration::from_micros(1_700_000_000_123_456);
        assert_eq!(to_timestamp(t), 1_700_000_000_123_456);
        assert_eq!(from_timestamp(to_timestamp(t)), t);
        let before_epoch = UNIX_EPOCH - Duration::from_secs(1);
        assert_eq!(to_timestamp(before_epoch), -1_000_000);
        assert_eq!(from_timestamp(-1_000_000), before_epoch);
    }

    #[tokio::test]
    async fn lsn_by_timestamp() {
        let harness = TenantHarness::create("lsn_by_timestamp").unwrap();
        let tenant = harness.load().await;
        let tline = tenant
            .create_test_timeline(TIMELINE_ID, Lsn(0x10))
            .await
            .unwrap();

        // nothing committed yet
        let res = tline.find_lsn_for_timestamp(to_timestamp(SystemTime::now())).await.unwrap();
        assert_eq!(res.kind(), LsnByTimestampKind::NoData);

        let start_lsn = Lsn(0x20);
        let base = SystemTime::now() - HOUR;
        let commits = commit_sequence(&tline, base, 10).await;
        let (_, last_commit) = commits[commits.len() - 1];

        let res = tline
            .find_lsn_for_timestamp(to_timestamp(last_commit + HOUR))
            .await
            .unwrap();
        assert_eq!(res.kind(), LsnByTimestampKind::Future);
        assert!(res.lsn() > start_lsn);

        let res = tline
            .find_lsn_for_timestamp(to_timestamp(base - 10 * HOUR))
            .await
            .unwrap();
        assert_eq!(res.kind(), LsnByTimestampKind::Past);
        assert!(res.lsn() < start_lsn);

        for (i, (lsn, time)) in commits.iter().enumerate().take(commits.len() - 1) {
            let res = tline.find_lsn_for_timestamp(to_timestamp(*time)).await.unwrap();
            assert_eq!(res, LsnForTimestamp::Present(Lsn(lsn.0 + 0xf)), "commit {i}");
            // the commit is visible at the returned lsn, the next one is not
            assert_eq!(tline.get_timestamp_for_lsn(res.lsn()).await.unwrap(), to_timestamp(*time));
        }

        // a branch never goes back past its branch point
        let branch_point = commits[5].0;
        let child = tenant
            .branch_timeline_test(&tline, TimelineId::generate(), branch_point)
            .await
            .unwrap();
        let res = child
            .find_lsn_for_timestamp(to_timestamp(base - 10 * HOUR))
            .await
            .unwrap();
        assert_eq!(res.kind(), LsnByTimestampKind::Past);
        assert!(res.lsn() >= branch_point);
    }

    #[tokio::test]
    async fn timestamp_of_lsn() {
        let harness = TenantHarness::create("timestamp_of_lsn").unwrap();
        let tenant = harness.load().await;
        let tline = tenant
            .create_test_timeline(TIMELINE_ID, Lsn(0x10))
            .await
            .unwrap();
        let commits = commit_sequence(&tline, SystemTime::now() - HOUR, 10).await;

        assert!(matches!(
            tline.get_timestamp_for_lsn(Lsn(0)).await,
            Err(TimestampLookupError::InvalidLsn)
        ));
        assert!(matches!(
            tline.get_timestamp_for_lsn(Lsn(0x18)).await,
            Err(TimestampLookupError::Read(PageReconstructError::MissingKey { .. }))
        ));

        let mut prev = TimestampTz::MIN;
        for lsn in (0x20..=0xb0).step_by(8) {
            let ts = tline.get_timestamp_for_lsn(Lsn(lsn)).await.unwrap();
            assert!(ts >= prev);
            prev = ts;
        }
        let (last_lsn, last_time) = commits[commits.len() - 1];
        assert_eq!(
            tline.get_timestamp_for_lsn(Lsn(last_lsn.0 * 20)).await.unwrap(),
            to_timestamp(last_time)
        );
    }
}
