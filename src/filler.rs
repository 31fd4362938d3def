use rand::Rng;
use uuid::Uuid;

use crate::channels::{Channel, FillerCollection, FillerShow, OfflineMode, Program, SLACK_MS};
use crate::playback::PlaybackCache;

/// A clip that has never aired on the channel counts as this stale.
const NEVER_PLAYED_AGE_MS: i64 = 7 * 24 * 60 * 60 * 1000;
/// Staleness stops mattering past five hours.
const STALENESS_CAP_MS: i64 = 5 * 60 * 60 * 1000;
/// Keep first-join shuffle starts clear of the clip's final seconds.
const FIRST_JOIN_TAIL_MS: i64 = 15_000;

#[derive(Debug, Clone)]
pub struct FillerPick {
    /// None when the channel's static fallback clip was used.
    pub show_id: Option<Uuid>,
    pub clip: Program,
    pub start_ms: i64,
}

#[derive(Debug, Clone)]
pub struct FillerOutcome {
    pub pick: Option<FillerPick>,
    /// Shortest cooldown shortfall seen among rejected candidates. When no
    /// clip was eligible the caller shortens the offline gap to this so the
    /// next resolve attempt has candidates.
    pub minimum_wait_ms: i64,
}

/// Two-level weighted lottery over the channel's filler collections: first a
/// cooldown-gated draw across collections proportional to weight, then a
/// staleness-and-fit weighted draw across the chosen show's clips.
pub fn pick_filler(
    channel: &Channel,
    shows: &[(FillerCollection, FillerShow)],
    cache: &PlaybackCache,
    remaining_ms: i64,
    is_first_join: bool,
    now_ms: i64,
    rng: &mut impl Rng,
) -> FillerOutcome {
    let mut minimum_wait = i64::MAX;

    // Collection lottery: running-sum reservoir, weight-proportional.
    let mut chosen: Option<&(FillerCollection, FillerShow)> = None;
    let mut weight_sum = 0.0f64;
    for pair in shows {
        let (collection, _) = pair;
        if collection.weight <= 0.0 {
            continue;
        }
        if let Some(last) = cache.last_played_filler_show(channel.number, collection.show_id) {
            let since = now_ms - last;
            if since < collection.cooldown_ms {
                minimum_wait = minimum_wait.min(collection.cooldown_ms - since);
                continue;
            }
        }
        weight_sum += collection.weight;
        if rng.gen::<f64>() < collection.weight / weight_sum {
            chosen = Some(pair);
        }
    }

    let mut picked: Option<(Uuid, Program)> = None;
    if let Some((collection, show)) = chosen {
        let repeat_cooldown = channel.filler_repeat_cooldown_ms - SLACK_MS;
        let mut clip_weight_sum = 0i64;
        for clip in &show.clips {
            if clip.duration_ms > remaining_ms + SLACK_MS {
                continue;
            }
            let since = cache
                .last_played_item(channel.number, &clip.key.cache_key())
                .map(|last| now_ms - last)
                .unwrap_or(NEVER_PLAYED_AGE_MS);
            if since < repeat_cooldown {
                let shortfall = repeat_cooldown - since;
                if clip.duration_ms + shortfall <= remaining_ms + SLACK_MS {
                    minimum_wait = minimum_wait.min(shortfall);
                }
                continue;
            }
            let weight = staleness_weight(since.min(STALENESS_CAP_MS))
                + duration_weight(clip.duration_ms);
            clip_weight_sum += weight;
            if rng.gen_range(0..clip_weight_sum) < weight {
                picked = Some((collection.show_id, clip.clone()));
            }
        }
    }

    let pick = match picked {
        Some((show_id, clip)) => Some(FillerPick {
            start_ms: first_join_start(&clip, remaining_ms, is_first_join, rng),
            show_id: Some(show_id),
            clip,
        }),
        None => fallback_pick(channel, remaining_ms, is_first_join, rng),
    };

    FillerOutcome {
        pick,
        minimum_wait_ms: minimum_wait,
    }
}

/// Fresh tune-ins start somewhere inside the clip so every join doesn't land
/// on the same opener.
fn first_join_start(
    clip: &Program,
    remaining_ms: i64,
    is_first_join: bool,
    rng: &mut impl Rng,
) -> i64 {
    if !is_first_join {
        return 0;
    }
    let max_start = clip.duration_ms - remaining_ms - FIRST_JOIN_TAIL_MS - SLACK_MS;
    if max_start > 0 {
        rng.gen_range(0..max_start)
    } else {
        0
    }
}

fn fallback_pick(
    channel: &Channel,
    remaining_ms: i64,
    is_first_join: bool,
    rng: &mut impl Rng,
) -> Option<FillerPick> {
    if channel.offline.mode != OfflineMode::Clip {
        return None;
    }
    let clip = channel.offline.fallback.first()?.clone();
    Some(FillerPick {
        start_ms: first_join_start(&clip, remaining_ms, is_first_join, rng),
        show_id: None,
        clip,
    })
}

/// Longer clips win a modest bonus; past three minutes the growth flattens to
/// logarithmic so a feature-length filler cannot dominate the draw.
fn duration_weight(duration_ms: i64) -> i64 {
    let mut minutes = duration_ms as f64 / 60_000.0;
    if minutes >= 3.0 {
        minutes = 3.0 + minutes.ln();
    }
    let scaled = (1_000.0 * minutes).ceil();
    ((10_000.0 * scaled + 10_000.0) / 1_000_000.0).ceil() as i64 + 1
}

/// Quadratic preference for clips that have rested longest.
fn staleness_weight(since_ms: i64) -> i64 {
    let steps = (since_ms as f64 / 600.0).ceil() + 1.0;
    ((steps * steps) / 1_000_000.0).ceil() as i64 + 1
}
