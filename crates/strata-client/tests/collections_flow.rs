//! Collection-id resolution: single-flight misses and key prefixing.

mod common;

use std::time::{Duration, Instant};

use bytes::Bytes;
use common::{cluster_config, test_agent_config, Action, FakeNode, ReplySpec};
use strata_client::wire::{take_uleb128, Opcode, Status};
use strata_client::{
    Agent, CollectionSpec, MutateInOp, MutateInOpKind, MutateInOptions,
};

fn cid_reply(manifest: u64, cid: u32, delay: Duration) -> Action {
    let mut extras = Vec::with_capacity(12);
    extras.extend_from_slice(&manifest.to_be_bytes());
    extras.extend_from_slice(&cid.to_be_bytes());
    Action::Reply(
        ReplySpec::status(Status::SUCCESS)
            .with_extras(extras)
            .with_delay(delay),
    )
}

fn mutate_opts(key: &[u8]) -> MutateInOptions {
    let mut opts = MutateInOptions::new(
        key,
        vec![MutateInOp {
            kind: MutateInOpKind::DictSet,
            flags: 0,
            path: "field".to_string(),
            value: Bytes::from_static(b"1"),
        }],
    );
    opts.collection = Some(CollectionSpec::new("s", "c"));
    opts.deadline = Instant::now() + Duration::from_secs(5);
    opts
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_misses_collapse_to_one_lookup() {
    let node = FakeNode::start().await;
    node.set_config(cluster_config(1, &[node.addr_string()], 64, |_| 0));
    node.set_handler(|frame| match frame.opcode {
        Opcode::COLLECTIONS_GET_CID => cid_reply(1, 42, Duration::from_millis(150)),
        Opcode::SUBDOC_MULTI_MUTATION => {
            Action::Reply(ReplySpec::ok_value(&b""[..], 0x99))
        }
        other => panic!("unexpected opcode {other:?}"),
    });

    let agent = Agent::connect(test_agent_config(&[&node]))
        .await
        .expect("connect");
    agent
        .wait_until_ready(Instant::now() + Duration::from_secs(10))
        .await
        .expect("ready");

    let mut tasks = Vec::new();
    for idx in 0..8 {
        let agent = agent.clone();
        let key = format!("doc{idx}");
        tasks.push(tokio::spawn(async move {
            agent.mutate_in(mutate_opts(key.as_bytes())).await
        }));
    }
    for task in tasks {
        task.await.expect("task").expect("mutate_in");
    }

    // Eight concurrent misses, one wire lookup.
    assert_eq!(node.count(Opcode::COLLECTIONS_GET_CID), 1);
    assert_eq!(node.count(Opcode::SUBDOC_MULTI_MUTATION), 8);

    // Every mutation carried the resolved id as a leb128 key prefix.
    for frame in node.frames_for(Opcode::SUBDOC_MULTI_MUTATION) {
        let (cid, width) = take_uleb128(&frame.key).expect("prefix");
        assert_eq!(cid, 42);
        assert!(frame.key[width..].starts_with(b"doc"));
    }
    agent.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn cache_hits_skip_the_wire() {
    let node = FakeNode::start().await;
    node.set_config(cluster_config(1, &[node.addr_string()], 64, |_| 0));
    node.set_handler(|frame| match frame.opcode {
        Opcode::COLLECTIONS_GET_CID => cid_reply(1, 9, Duration::from_millis(10)),
        _ => Action::Reply(ReplySpec::ok_value(&b""[..], 0x1)),
    });

    let agent = Agent::connect(test_agent_config(&[&node]))
        .await
        .expect("connect");
    agent
        .wait_until_ready(Instant::now() + Duration::from_secs(10))
        .await
        .expect("ready");

    agent
        .mutate_in(mutate_opts(b"first"))
        .await
        .expect("first mutate");
    agent
        .mutate_in(mutate_opts(b"second"))
        .await
        .expect("second mutate");

    assert_eq!(node.count(Opcode::COLLECTIONS_GET_CID), 1);
    assert_eq!(node.count(Opcode::SUBDOC_MULTI_MUTATION), 2);
    agent.close().await;
}
