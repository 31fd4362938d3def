use tracing::warn;
use uuid::Uuid;

use crate::channels::{Channel, LineupItem};
use crate::errors::StreamError;
use crate::lineup::{self, ResolvedSlot};
use crate::store::Store;

/// How long the surfaced offline item runs when a redirect cycle is hit.
pub const CYCLE_ITEM_MS: i64 = 60_000;

#[derive(Debug, Clone)]
pub struct RedirectedSlot {
    /// Channel whose item actually airs (the origin unless redirects fired).
    pub channel: Channel,
    pub slot: ResolvedSlot,
    /// Remaining playable time, bounded so the client leaves a redirected
    /// channel no later than the redirect item itself would have ended.
    pub stream_duration_ms: i64,
    /// Numbers of every channel traversed, origin first.
    pub hops: Vec<u32>,
    /// Cycle diagnostics; the stream must keep playing, so this is carried as
    /// data rather than an HTTP failure.
    pub error: Option<String>,
}

/// Resolves the slot for `origin` at `now_ms`, chasing `redirect` items across
/// channels until a playable item is found. Terminates in at most one hop per
/// channel in the catalog; a repeat visit is a cycle and degrades to a 60 s
/// offline slot carrying the cycle path.
pub async fn walk(
    store: &Store,
    origin: &Channel,
    origin_lineup: &[LineupItem],
    now_ms: i64,
) -> Result<RedirectedSlot, StreamError> {
    let mut visited: Vec<Uuid> = vec![origin.id];
    let mut hops: Vec<u32> = vec![origin.number];
    let mut bounds: Vec<i64> = Vec::new();

    let mut channel = origin.clone();
    let mut slot = lineup::resolve(&channel, origin_lineup, now_ms)?;

    loop {
        let (target, duration_ms) = match slot.item {
            LineupItem::Redirect {
                channel_id,
                duration_ms,
            } => (channel_id, duration_ms),
            _ => break,
        };

        let remaining = duration_ms - slot.time_into_item_ms - slot.beginning_offset_ms;

        if visited.contains(&target) {
            let path = visited
                .iter()
                .chain(std::iter::once(&target))
                .map(Uuid::to_string)
                .collect::<Vec<_>>()
                .join(" -> ");
            let cycle = StreamError::RedirectCycle { path };
            warn!("channel {}: {}", origin.number, cycle);
            return Ok(RedirectedSlot {
                channel,
                slot: ResolvedSlot {
                    item: LineupItem::Offline {
                        duration_ms: CYCLE_ITEM_MS,
                    },
                    index: slot.index,
                    time_into_item_ms: 0,
                    beginning_offset_ms: 0,
                },
                stream_duration_ms: CYCLE_ITEM_MS,
                hops,
                error: Some(cycle.to_string()),
            });
        }

        let Some((next, next_lineup)) = store.channel_and_lineup(target).await else {
            // The catalog guarantees redirect targets exist; a miss means the
            // channel vanished mid-request. Degrade like a cycle.
            warn!(
                "redirect target {} missing (from channel {})",
                target, channel.number
            );
            return Ok(RedirectedSlot {
                channel,
                slot: ResolvedSlot {
                    item: LineupItem::Offline {
                        duration_ms: CYCLE_ITEM_MS,
                    },
                    index: slot.index,
                    time_into_item_ms: 0,
                    beginning_offset_ms: 0,
                },
                stream_duration_ms: CYCLE_ITEM_MS,
                hops,
                error: Some(format!("Redirect target {target} does not exist")),
            });
        };

        visited.push(target);
        hops.push(next.number);
        bounds.push(remaining);

        slot = lineup::resolve(&next, &next_lineup, now_ms)?;
        channel = next;
    }

    // Innermost bound first: each enclosing redirect caps how long this join
    // may keep playing the redirected channel.
    let mut stream_duration = slot.remaining_ms();
    for bound in bounds.iter().rev() {
        stream_duration = stream_duration.min(bound + slot.beginning_offset_ms);
    }

    Ok(RedirectedSlot {
        channel,
        slot,
        stream_duration_ms: stream_duration,
        hops,
        error: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::OfflineSettings;
    use crate::store::{Catalog, CatalogChannel};

    fn channel(number: u32, duration_ms: i64) -> Channel {
        Channel {
            id: Uuid::new_v4(),
            number,
            name: format!("ch{number}"),
            group_title: String::new(),
            start_time_ms: 0,
            duration_ms,
            icon: None,
            watermark: None,
            offline: OfflineSettings::default(),
            transcoding: None,
            stealth: false,
            filler_collections: Vec::new(),
            filler_repeat_cooldown_ms: 0,
            disable_filler_overlay: false,
        }
    }

    fn store_of(entries: Vec<(Channel, Vec<LineupItem>)>) -> Store {
        Store::from_catalog(Catalog {
            channels: entries
                .into_iter()
                .map(|(channel, lineup)| CatalogChannel { channel, lineup })
                .collect(),
            programs: Vec::new(),
            filler_shows: Vec::new(),
        })
    }

    #[tokio::test]
    async fn non_redirect_items_pass_through() {
        let ch = channel(1, 600_000);
        let lineup = vec![LineupItem::Offline {
            duration_ms: 600_000,
        }];
        let store = store_of(vec![(ch.clone(), lineup.clone())]);

        let out = walk(&store, &ch, &lineup, 100_000).await.unwrap();
        assert!(out.error.is_none());
        assert_eq!(out.hops, vec![1]);
        assert!(out.slot.item.is_offline());
        assert_eq!(out.stream_duration_ms, 500_000);
    }

    #[tokio::test]
    async fn redirect_lands_on_target_channel_item() {
        let target = channel(2, 600_000);
        let target_lineup = vec![LineupItem::Content {
            program_id: Uuid::new_v4(),
            duration_ms: 600_000,
        }];
        let origin = channel(1, 300_000);
        let origin_lineup = vec![LineupItem::Redirect {
            channel_id: target.id,
            duration_ms: 300_000,
        }];
        let store = store_of(vec![
            (origin.clone(), origin_lineup.clone()),
            (target.clone(), target_lineup),
        ]);

        let out = walk(&store, &origin, &origin_lineup, 60_000).await.unwrap();
        assert_eq!(out.channel.number, 2);
        assert_eq!(out.hops, vec![1, 2]);
        // Target item has 540s left, but the redirect slot only has 240s left.
        assert_eq!(out.stream_duration_ms, 240_000);
    }

    #[tokio::test]
    async fn two_channel_cycle_degrades_to_offline_with_both_ids() {
        let x = channel(1, 600_000);
        let y = channel(2, 600_000);
        let x_lineup = vec![LineupItem::Redirect {
            channel_id: y.id,
            duration_ms: 600_000,
        }];
        let y_lineup = vec![LineupItem::Redirect {
            channel_id: x.id,
            duration_ms: 600_000,
        }];
        let store = store_of(vec![
            (x.clone(), x_lineup.clone()),
            (y.clone(), y_lineup),
        ]);

        let out = walk(&store, &x, &x_lineup, 50_000).await.unwrap();
        let error = out.error.expect("cycle should surface an error");
        assert!(error.contains(&x.id.to_string()));
        assert!(error.contains(&y.id.to_string()));
        assert_eq!(
            out.slot.item,
            LineupItem::Offline {
                duration_ms: CYCLE_ITEM_MS
            }
        );
        assert_eq!(out.stream_duration_ms, CYCLE_ITEM_MS);
    }

    #[tokio::test]
    async fn missing_target_degrades_like_a_cycle() {
        let origin = channel(1, 600_000);
        let origin_lineup = vec![LineupItem::Redirect {
            channel_id: Uuid::new_v4(),
            duration_ms: 600_000,
        }];
        let store = store_of(vec![(origin.clone(), origin_lineup.clone())]);

        let out = walk(&store, &origin, &origin_lineup, 0).await.unwrap();
        assert!(out.error.unwrap().contains("does not exist"));
    }

    #[tokio::test]
    async fn chained_redirects_respect_every_bound() {
        // a(redirect 300s) -> b(redirect 120s) -> c(content 600s).
        let c = channel(3, 600_000);
        let c_lineup = vec![LineupItem::Content {
            program_id: Uuid::new_v4(),
            duration_ms: 600_000,
        }];
        let b = channel(2, 120_000);
        let b_lineup = vec![LineupItem::Redirect {
            channel_id: c.id,
            duration_ms: 120_000,
        }];
        let a = channel(1, 300_000);
        let a_lineup = vec![LineupItem::Redirect {
            channel_id: b.id,
            duration_ms: 300_000,
        }];
        let store = store_of(vec![
            (a.clone(), a_lineup.clone()),
            (b, b_lineup),
            (c, c_lineup),
        ]);

        let out = walk(&store, &a, &a_lineup, 60_000).await.unwrap();
        assert_eq!(out.channel.number, 3);
        assert_eq!(out.hops, vec![1, 2, 3]);
        // b's slot at 60s has 60s left (120s loop), tighter than a's 240s.
        assert_eq!(out.stream_duration_ms, 60_000);
    }
}
