// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::any::Any;
use std::sync::Arc;

use arbor::network::LocalNetworkCore;
use arbor::{
    Config, Envelope, Message, Node, Overlay, ProtocolError, ProtocolFactory, ProtocolInstance,
    Roster, Tree, TreeNodeIndex,
};
use async_trait::async_trait;
use divan::counter::ItemsCount;
use serde::{Deserialize, Serialize};

fn main() {
    // run registered benchmarks.
    divan::main();
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Vote(u64);

impl Message for Vote {
    const NAME: &'static str = "bench::Vote";
}

struct Sink;

#[async_trait]
impl ProtocolInstance for Sink {
    async fn start(&self) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[divan::bench(args = [16, 256, 4096])]
fn tree_construction(bencher: divan::Bencher, n: u64) {
    let roster = Arc::new(Roster::new((0..n).collect()));
    bencher
        .counter(ItemsCount::new(n as usize))
        .bench(|| Tree::new_nary(Arc::clone(&roster), 8, 0).unwrap());
}

#[divan::bench(args = [2, 8, 32])]
fn aggregate_children(bencher: divan::Bencher, k: u32) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let _guard = rt.enter();
    let core = Arc::new(LocalNetworkCore::new());
    let network = rt.block_on(core.join(0));
    let overlay = Overlay::new(Arc::new(network), Config::default());
    let factory: ProtocolFactory = Arc::new(
        |node: Arc<Node>| -> Result<Arc<dyn ProtocolInstance>, ProtocolError> {
            node.register_handler::<Vote, _>(|batch| {
                divan::black_box(batch);
                Ok(())
            })?;
            Ok(Arc::new(Sink))
        },
    );
    overlay.register_protocol("bench", factory).unwrap();
    let roster = Arc::new(Roster::new((0..=u64::from(k)).collect()));

    bencher
        .counter(ItemsCount::new(k as usize))
        .with_inputs(|| {
            let tree = Tree::new_nary(Arc::clone(&roster), k as usize, 0).unwrap();
            let node = overlay.create_protocol("bench", tree).unwrap();
            let envelopes: Vec<_> = (1..=k)
                .map(|i| {
                    Envelope::new(*node.token(), TreeNodeIndex::new(i), &Vote(u64::from(i)))
                        .unwrap()
                })
                .collect();
            (node, envelopes)
        })
        .bench_values(|(node, envelopes)| {
            for envelope in envelopes {
                overlay.route(envelope).unwrap();
            }
            node.cancel();
        });
}
