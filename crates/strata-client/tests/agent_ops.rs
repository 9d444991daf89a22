//! End-to-end operation flows against a scripted node.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{cluster_config, test_agent_config, Action, FakeNode, ReplySpec};
use strata_client::wire::{vbucket_for_key, Opcode, Status};
use strata_client::{Agent, CancelHandle, ErrorKind, GetOptions, StoreOptions};

async fn ready_agent(node: &FakeNode) -> Agent {
    let agent = Agent::connect(test_agent_config(&[node]))
        .await
        .expect("connect");
    agent
        .wait_until_ready(Instant::now() + Duration::from_secs(10))
        .await
        .expect("ready");
    agent
}

#[tokio::test(flavor = "multi_thread")]
async fn happy_path_get_routes_by_vbucket() {
    let node = FakeNode::start().await;
    node.set_config(cluster_config(1, &[node.addr_string()], 1024, |_| 0));
    node.set_handler(|frame| {
        assert_eq!(frame.opcode, Opcode::GET);
        Action::Reply(ReplySpec::ok_value(&b"bar"[..], 0x1234).with_extras(vec![0u8; 4]))
    });

    let agent = ready_agent(&node).await;
    let mut opts = GetOptions::new(&b"foo"[..]);
    opts.deadline = Instant::now() + Duration::from_secs(5);
    let result = agent.get(opts).await.expect("get");
    assert_eq!(result.value.as_ref(), b"bar");
    assert_eq!(result.cas, 0x1234);

    let frames = node.frames_for(Opcode::GET);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].key.as_ref(), b"foo");
    assert_eq!(frames[0].vbucket(), 115);
    agent.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn set_surfaces_cas_and_mutation_token() {
    let node = FakeNode::start().await;
    node.set_config(cluster_config(1, &[node.addr_string()], 1024, |_| 0));
    node.set_handler(|frame| {
        assert_eq!(frame.opcode, Opcode::SET);
        let mut extras = Vec::new();
        extras.extend_from_slice(&0x1111_2222_3333_4444u64.to_be_bytes());
        extras.extend_from_slice(&9u64.to_be_bytes());
        Action::Reply(ReplySpec::ok_value(&b""[..], 0x42).with_extras(extras))
    });

    let agent = ready_agent(&node).await;
    let mut opts = StoreOptions::new(&b"doc"[..], &b"{}"[..]);
    opts.deadline = Instant::now() + Duration::from_secs(5);
    let result = agent.set(opts).await.expect("set");
    assert_eq!(result.cas, 0x42);
    let token = result.mutation_token.expect("token");
    assert_eq!(token.vbucket_uuid, 0x1111_2222_3333_4444);
    assert_eq!(token.seqno, 9);
    assert_eq!(token.vbucket_id, vbucket_for_key(b"doc", 1024));
    agent.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn out_of_order_replies_resolve_by_opaque() {
    let node = FakeNode::start().await;
    node.set_config(cluster_config(1, &[node.addr_string()], 64, |_| 0));
    node.set_handler(|frame| {
        if frame.key.as_ref() == b"slow" {
            Action::Reply(
                ReplySpec::ok_value(&b"S"[..], 1).with_delay(Duration::from_millis(300)),
            )
        } else {
            Action::Reply(ReplySpec::ok_value(&b"F"[..], 2))
        }
    });

    let agent = ready_agent(&node).await;
    let deadline = Instant::now() + Duration::from_secs(5);
    let slow = {
        let agent = agent.clone();
        async move {
            let mut opts = GetOptions::new(&b"slow"[..]);
            opts.deadline = deadline;
            let result = agent.get(opts).await.expect("slow get");
            (result, Instant::now())
        }
    };
    let fast = {
        let agent = agent.clone();
        async move {
            // Give the slow request a head start onto the same socket.
            tokio::time::sleep(Duration::from_millis(50)).await;
            let mut opts = GetOptions::new(&b"fast"[..]);
            opts.deadline = deadline;
            let result = agent.get(opts).await.expect("fast get");
            (result, Instant::now())
        }
    };
    let ((slow_result, slow_done), (fast_result, fast_done)) = tokio::join!(slow, fast);
    assert_eq!(slow_result.value.as_ref(), b"S");
    assert_eq!(fast_result.value.as_ref(), b"F");
    // The later submission completed first: replies were correlated by
    // opaque, not arrival order.
    assert!(fast_done < slow_done);
    agent.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn tmpfail_is_redriven_until_success() {
    let node = FakeNode::start().await;
    node.set_config(cluster_config(1, &[node.addr_string()], 64, |_| 0));
    let attempts = Arc::new(AtomicU32::new(0));
    {
        let attempts = attempts.clone();
        node.set_handler(move |_frame| {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Action::Reply(ReplySpec::status(Status::TMP_FAIL))
            } else {
                Action::Reply(ReplySpec::ok_value(&b"v"[..], 7))
            }
        });
    }

    let agent = ready_agent(&node).await;
    let mut opts = GetOptions::new(&b"k"[..]);
    opts.deadline = Instant::now() + Duration::from_secs(5);
    let result = agent.get(opts).await.expect("get after tmpfail");
    assert_eq!(result.value.as_ref(), b"v");
    assert_eq!(node.count(Opcode::GET), 3);
    agent.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn callback_form_runs_once_on_driver_task() {
    let node = FakeNode::start().await;
    node.set_config(cluster_config(1, &[node.addr_string()], 64, |_| 0));
    node.set_handler(|_frame| Action::Reply(ReplySpec::ok_value(&b"x"[..], 3)));

    let agent = ready_agent(&node).await;
    let calls = Arc::new(AtomicU32::new(0));
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    {
        let calls = calls.clone();
        let mut opts = GetOptions::new(&b"cb"[..]);
        opts.deadline = Instant::now() + Duration::from_secs(5);
        let mut done_tx = Some(done_tx);
        agent.get_with(opts, move |result| {
            calls.fetch_add(1, Ordering::SeqCst);
            let _ = done_tx.take().expect("single invocation").send(result);
        });
    }
    let result = done_rx.await.expect("callback ran").expect("get ok");
    assert_eq!(result.value.as_ref(), b"x");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    agent.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn closed_agent_rejects_work_without_reviving_pools() {
    let node = FakeNode::start().await;
    node.set_config(cluster_config(1, &[node.addr_string()], 64, |_| 0));
    node.set_handler(|_frame| Action::Reply(ReplySpec::ok_value(&b"x"[..], 1)));

    let agent = ready_agent(&node).await;
    agent.close().await;

    let connections_at_close = node.count(Opcode::HELLO);
    let mut opts = GetOptions::new(&b"k"[..]);
    opts.deadline = Instant::now() + Duration::from_secs(2);
    let err = agent.get(opts).await.expect_err("agent closed");
    assert_eq!(err.kind, ErrorKind::Shutdown);

    // A post-close submission must not resurrect an endpoint pool; no new
    // connection may be dialed.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(node.count(Opcode::HELLO), connections_at_close);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_requests_drop_at_dispatch() {
    let node = FakeNode::start().await;
    node.set_config(cluster_config(1, &[node.addr_string()], 64, |_| 0));

    let agent = ready_agent(&node).await;
    let handle = CancelHandle::new();
    handle.cancel();
    let mut opts = GetOptions::new(&b"k"[..]);
    opts.deadline = Instant::now() + Duration::from_secs(5);
    opts.cancel = Some(handle);
    let err = agent.get(opts).await.expect_err("cancelled");
    assert_eq!(err.kind, ErrorKind::RequestCanceled);
    // The request never reached the wire.
    assert_eq!(node.count(Opcode::GET), 0);
    agent.close().await;
}
