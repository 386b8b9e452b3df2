//! Human and JSON rendering of API responses.

use std::fmt::Display;

use anyhow::Result;
use pops_api::{EngineStats, GroupId, PlayerId, PopApi, PopsConfig, RunOutcome};
use serde::Serialize;
use serde_json::json;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Output { Human, Json }

/// Single value: `Display` for humans, compact JSON otherwise.
pub fn line<T: Serialize + Display>(out: Output, v: &T) -> Result<String> {
    Ok(match out {
        Output::Human => v.to_string(),
        Output::Json => serde_json::to_string(v)?,
    })
}

pub fn applied(out: Output, id: &str) -> Result<String> {
    Ok(match out {
        Output::Human => format!("applied {}", id),
        Output::Json => json!({ "id": id, "applied": true }).to_string(),
    })
}

pub async fn top(out: Output, api: &dyn PopApi, group: GroupId) -> Result<String> {
    let rows = api.get_top_ten(group).await?;
    Ok(match out {
        Output::Human if rows.is_empty() => format!("group {} • no scores yet", group),
        Output::Human => rows
            .iter()
            .enumerate()
            .map(|(i, e)| format!("{:>2}. {} • {}", i + 1, e.player, e.score))
            .collect::<Vec<_>>()
            .join("\n"),
        Output::Json => serde_json::to_string_pretty(&rows)?,
    })
}

pub async fn player(out: Output, api: &dyn PopApi, group: GroupId, player: PlayerId) -> Result<String> {
    let score = api.get_player_score(group, player).await?;
    Ok(match out {
        Output::Human => format!("{} • group {} • {}", player, group, score),
        Output::Json => json!({ "player": player, "group": group, "score": score }).to_string(),
    })
}

pub async fn groups(out: Output, api: &dyn PopApi) -> Result<String> {
    let t = api.get_pop_by_groups().await?;
    Ok(match out {
        Output::Human => {
            let mut lines: Vec<String> = t.totals.iter().map(|(g, v)| format!("group {} • {}", g, v)).collect();
            lines.extend(t.unreachable.iter().map(|g| format!("group {} • unreachable", g)));
            lines.push(format!("total • {}{}", t.sum(), if t.is_complete() { "" } else { " (partial)" }));
            lines.join("\n")
        }
        Output::Json => serde_json::to_string_pretty(&t)?,
    })
}

pub async fn global(out: Output, api: &dyn PopApi, player: PlayerId) -> Result<String> {
    let total = api.get_global_player_total(player).await?;
    Ok(match out {
        Output::Human => format!("{} • {}", player, total),
        Output::Json => json!({ "player": player, "total": total }).to_string(),
    })
}

pub async fn snapshot_groups(out: Output, api: &dyn PopApi) -> Result<String> {
    let totals = api.get_group_totals_snapshot().await?;
    Ok(match out {
        Output::Human if totals.is_empty() => "snapshot is empty".to_string(),
        Output::Human => totals.iter().map(|(g, v)| format!("group {} • {}", g, v)).collect::<Vec<_>>().join("\n"),
        Output::Json => serde_json::to_string_pretty(&totals)?,
    })
}

pub fn outcome(out: Output, o: &RunOutcome) -> Result<String> {
    Ok(match (out, o) {
        (Output::Json, o) => serde_json::to_string(o)?,
        (Output::Human, RunOutcome::Applied(r)) => format!(
            "reconciled {} events in ({}, {}] • {} chunk(s) written • {} ms",
            r.events, r.from, r.upper, r.chunks_written, r.took_ms
        ),
        (Output::Human, RunOutcome::NoChange) => "reconcile • no settled events".to_string(),
        (Output::Human, RunOutcome::Skipped) => "reconcile • skipped, another run in progress".to_string(),
    })
}

pub fn stats(out: Output, s: &EngineStats) -> Result<String> {
    Ok(match out {
        Output::Human => format!(
            "accepted {} • acked {} • retried {} • dead-lettered {} • rejected {} • watermark {}",
            s.accepted, s.acked, s.retried, s.dead_lettered, s.rejected, s.watermark
        ),
        Output::Json => serde_json::to_string_pretty(s)?,
    })
}

pub fn config(out: Output, cfg: &PopsConfig) -> Result<String> {
    Ok(match out {
        Output::Human => {
            let groups: Vec<String> = cfg.groups.iter().map(|g| g.to_string()).collect();
            [
                format!("groups            {}", groups.join(",")),
                format!("db_path           {}", cfg.db_path),
                format!("queue_cap         {}", cfg.queue_cap),
                format!("max_batch         {}", cfg.max_batch),
                format!("flush_ms          {}", cfg.flush_ms),
                format!("max_attempts      {}", cfg.max_attempts),
                format!("max_amount        {}", cfg.max_amount),
                format!("reconcile_secs    {}", cfg.reconcile_secs),
                format!("settle_ms         {}", cfg.settle_ms),
                format!("watermark_start   {}", cfg.watermark_start),
                format!("chunks            {:?}", cfg.chunks),
                format!("shard_timeout_ms  {}", cfg.shard_timeout_ms),
                format!("warm_start        {}", cfg.warm_start),
                format!("checkpoint_every  {}", cfg.checkpoint_every),
            ]
            .join("\n")
        }
        Output::Json => serde_json::to_string_pretty(cfg)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pops_api::{LeaderboardEntry, MockApi};

    fn p(s: &str) -> PlayerId { PlayerId::parse(s).unwrap() }

    fn mock() -> MockApi {
        let mut m = MockApi::new();
        m.totals.insert(GroupId(1), 25);
        m.totals.insert(GroupId(4), 3);
        m.top.insert(
            GroupId(1),
            vec![
                LeaderboardEntry { player: p("6500000002"), score: 10 },
                LeaderboardEntry { player: p("6500000003"), score: 10 },
                LeaderboardEntry { player: p("6500000001"), score: 5 },
            ],
        );
        m
    }

    #[tokio::test]
    async fn top_human_lists_ranks() {
        let m = mock();
        let text = top(Output::Human, &m, GroupId(1)).await.unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], " 1. 6500000002 • 10");
        assert_eq!(lines[2], " 3. 6500000001 • 5");
        assert_eq!(top(Output::Human, &m, GroupId(4)).await.unwrap(), "group 4 • no scores yet");
    }

    #[tokio::test]
    async fn groups_marks_partial_results() {
        let mut m = mock();
        m.unreachable.push(GroupId(4));
        let text = groups(Output::Human, &m).await.unwrap();
        assert!(text.contains("group 4 • unreachable"));
        assert!(text.ends_with("total • 25 (partial)"));
        let v: serde_json::Value = serde_json::from_str(&groups(Output::Json, &m).await.unwrap()).unwrap();
        assert_eq!(v["totals"]["1"], 25);
        assert_eq!(v["unreachable"][0], 4);
    }

    #[tokio::test]
    async fn unknown_group_is_an_error() {
        let m = mock();
        assert!(player(Output::Json, &m, GroupId(9), p("6500000001")).await.is_err());
    }

    #[test]
    fn outcome_lines() {
        assert_eq!(outcome(Output::Human, &RunOutcome::NoChange).unwrap(), "reconcile • no settled events");
        assert_eq!(outcome(Output::Json, &RunOutcome::Skipped).unwrap(), "\"Skipped\"");
    }

    #[test]
    fn config_json_round_trips() {
        let cfg = PopsConfig::default();
        let text = config(Output::Json, &cfg).unwrap();
        let back: PopsConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back, cfg);
    }
}
