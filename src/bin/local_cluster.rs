// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use arbor::collect::{CollectTxRequest, Transaction, collect_txs, register_collect_tx};
use arbor::propagate::new_propagation_func;
use arbor::{Config, Roster, Tree, create_local_cluster, logging};
use clap::Parser;
use color_eyre::Result;
use color_eyre::eyre::Context;
use fastrace::collector::{Config as TraceConfig, ConsoleReporter};
use fastrace::prelude::*;
use log::{info, warn};

/// Runs propagation and transaction collection on an in-process cluster.
#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Number of peers in the cluster.
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
    peers: u64,
    /// Optional TOML config file, defaults are used otherwise.
    #[arg(long)]
    config: Option<String>,
    /// Propagation timeout in milliseconds, defaults to the configured one.
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// Directed links `FROM:TO` to break before running.
    #[arg(long, value_parser = parse_link)]
    break_link: Vec<(u64, u64)>,
    /// Peers to remove from the network before running, as if they crashed.
    #[arg(long)]
    crash: Vec<u64>,
    /// Prints collected spans to stdout.
    #[arg(long)]
    trace: bool,
}

fn parse_link(s: &str) -> Result<(u64, u64), String> {
    let (from, to) = s
        .split_once(':')
        .ok_or_else(|| format!("expected FROM:TO, got {s:?}"))?;
    let from = from.parse().map_err(|e| format!("invalid peer {from:?}: {e}"))?;
    let to = to.parse().map_err(|e| format!("invalid peer {to:?}: {e}"))?;
    Ok((from, to))
}

#[tokio::main]
async fn main() -> Result<()> {
    // enable fancy `color_eyre` error messages
    color_eyre::install()?;

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load(path).context("can not load config")?,
        None => Config::default(),
    };

    if args.trace {
        fastrace::set_reporter(ConsoleReporter, TraceConfig::default());
    }
    logging::enable_logforth();

    {
        let root = Span::root("local cluster", SpanContext::random());
        let _guard = root.set_local_parent();

        let (core, overlays) = create_local_cluster(args.peers, &config).await;
        for (from, to) in &args.break_link {
            warn!("breaking link {from} -> {to}");
            core.break_link(*from, *to).await;
        }
        for peer in &args.crash {
            warn!("crashing peer {peer}");
            core.leave(*peer).await;
        }

        let mut funcs = Vec::new();
        for overlay in &overlays {
            let id = overlay.peer_id();
            let func = new_propagation_func(
                overlay,
                "propagate",
                move |msg: String| info!("peer {id} received {msg:?}"),
                None,
            )?;
            funcs.push(func);
            let source = Arc::new(move |_: &CollectTxRequest| -> Vec<Transaction> {
                vec![Transaction(id.to_be_bytes().to_vec())]
            });
            register_collect_tx(overlay, "collect", source)?;
        }

        let roster = Arc::new(Roster::new((0..args.peers).collect()));
        let timeout = args
            .timeout_ms
            .map_or_else(|| config.default_timeout(), Duration::from_millis);
        match funcs[0]
            .propagate(&roster, &"hello".to_string(), timeout)
            .await
        {
            Ok(count) => info!("propagation reached {count} of {} peers", args.peers),
            Err(err) => warn!("propagation failed: {err}"),
        }

        let tree = Tree::new_nary(Arc::clone(&roster), config.branching_factor, 0)?;
        let request = CollectTxRequest {
            leader: 0,
            context: Vec::new(),
            max_txs: None,
        };
        let txs = collect_txs(&overlays[0], "collect", tree, request).await?;
        info!("collected {} transactions", txs.len());

        for overlay in &overlays {
            overlay.shutdown();
        }
    }

    fastrace::flush();

    Ok(())
}
