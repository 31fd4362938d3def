use crate::channels::{Channel, LineupItem, SLACK_MS};
use crate::errors::StreamError;

/// Joins under 30 s into an item are snapped back to its start; encoders and
/// container probes routinely lose the first seconds on a mid-file seek.
pub const START_SNAP_MS: i64 = 30_000;

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSlot {
    pub item: LineupItem,
    /// Index into the lineup; -1 when the channel has not started yet.
    pub index: isize,
    pub time_into_item_ms: i64,
    pub beginning_offset_ms: i64,
}

impl ResolvedSlot {
    /// Playable time left in the slot from this join.
    pub fn remaining_ms(&self) -> i64 {
        self.item.duration_ms() - self.time_into_item_ms - self.beginning_offset_ms
    }
}

/// Maps wall-clock time onto the looping lineup: which item is on the air at
/// `now_ms`, and how far into it the join lands.
pub fn resolve(
    channel: &Channel,
    lineup: &[LineupItem],
    now_ms: i64,
) -> Result<ResolvedSlot, StreamError> {
    if now_ms < channel.start_time_ms {
        return Ok(ResolvedSlot {
            item: LineupItem::Offline {
                duration_ms: channel.start_time_ms - now_ms,
            },
            index: -1,
            time_into_item_ms: 0,
            beginning_offset_ms: 0,
        });
    }

    if lineup.is_empty() {
        return Err(StreamError::LineupEmpty);
    }

    let total: i64 = lineup.iter().map(LineupItem::duration_ms).sum();
    if (total - channel.duration_ms).abs() > SLACK_MS {
        return Err(StreamError::LineupDurationMismatch {
            expected: channel.duration_ms,
            actual: total,
        });
    }

    let elapsed = (now_ms - channel.start_time_ms).rem_euclid(channel.duration_ms.max(1));

    let mut index = 0usize;
    let mut time_into = 0i64;
    let mut acc = 0i64;
    let mut found = false;
    for (i, item) in lineup.iter().enumerate() {
        let d = item.duration_ms();
        if elapsed < acc + d {
            index = i;
            time_into = elapsed - acc;
            found = true;
            break;
        }
        acc += d;
    }
    // The summed durations may fall short of channel.duration by up to SLACK;
    // a join inside that sliver wraps to the top of the lineup.
    if !found {
        index = 0;
        time_into = 0;
    }

    // Boundary smoothing: don't hand the client a program with under ~10s left.
    let item_duration = lineup[index].duration_ms();
    if item_duration > 2 * SLACK_MS && time_into > item_duration - SLACK_MS {
        index = (index + 1) % lineup.len();
        time_into = 0;
    }

    let mut beginning_offset = 0;
    if time_into < START_SNAP_MS {
        beginning_offset = time_into;
        time_into = 0;
    }

    Ok(ResolvedSlot {
        item: lineup[index].clone(),
        index: index as isize,
        time_into_item_ms: time_into,
        beginning_offset_ms: beginning_offset,
    })
}
