//! Not-my-vbucket convergence and topology-swap draining under live
//! traffic.

mod common;

use std::time::{Duration, Instant};

use common::{cluster_config, test_agent_config, Action, FakeNode, ReplySpec};
use strata_client::wire::{Opcode, Status};
use strata_client::{Agent, GetOptions};

#[tokio::test(flavor = "multi_thread")]
async fn nmv_installs_pushed_config_and_converges() {
    let node_a = FakeNode::start().await;
    let node_b = FakeNode::start().await;
    let addrs = vec![node_a.addr_string(), node_b.addr_string()];

    // The cached map points every vBucket at B; the truth is A.
    let stale = cluster_config(1, &addrs, 1024, |_| 1);
    let fresh = cluster_config(7, &addrs, 1024, |_| 0);
    node_a.set_config(stale.clone());
    node_b.set_config(stale);

    node_a.set_handler(|_frame| Action::Reply(ReplySpec::ok_value(&b"bar"[..], 0x99)));
    {
        let fresh = fresh.clone();
        node_b.set_handler(move |_frame| {
            Action::Reply(ReplySpec::status_with_value(
                Status::NOT_MY_VBUCKET,
                fresh.clone().into_bytes(),
            ))
        });
    }

    let agent = Agent::connect(test_agent_config(&[&node_a, &node_b]))
        .await
        .expect("connect");
    agent
        .wait_until_ready(Instant::now() + Duration::from_secs(10))
        .await
        .expect("ready");

    let mut opts = GetOptions::new(&b"foo"[..]);
    opts.deadline = Instant::now() + Duration::from_secs(5);
    let result = agent.get(opts).await.expect("get converges");
    assert_eq!(result.value.as_ref(), b"bar");

    // Exactly one misroute, exactly one converged retry.
    assert_eq!(node_b.count(Opcode::GET), 1);
    assert_eq!(node_a.count(Opcode::GET), 1);
    assert_eq!(agent.topology().rev, 7);
    agent.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn removed_endpoint_drains_and_requests_reissue() {
    let node_a = FakeNode::start().await;
    let node_c = FakeNode::start().await;
    let addrs = vec![node_a.addr_string(), node_c.addr_string()];

    // Rev 1 routes everything at C, which swallows requests.
    let rev1 = cluster_config(1, &addrs, 64, |_| 1);
    node_a.set_config(rev1.clone());
    node_c.set_config(rev1);
    node_a.set_handler(|_frame| Action::Reply(ReplySpec::ok_value(&b"bar"[..], 0x7)));
    node_c.set_handler(|_frame| Action::Silence);

    let agent = Agent::connect(test_agent_config(&[&node_a, &node_c]))
        .await
        .expect("connect");
    agent
        .wait_until_ready(Instant::now() + Duration::from_secs(10))
        .await
        .expect("ready");

    let in_flight = {
        let agent = agent.clone();
        tokio::spawn(async move {
            let mut opts = GetOptions::new(&b"foo"[..]);
            opts.deadline = Instant::now() + Duration::from_secs(15);
            agent.get(opts).await
        })
    };

    // Let the request reach C and sit in its opaque map.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(node_c.count(Opcode::GET), 1);
    assert!(!in_flight.is_finished());

    // Rev 2 removes C; the poller picks it up within a poll period, the
    // pool drains, and the in-flight request is reissued against A.
    let rev2 = cluster_config(2, &[node_a.addr_string()], 64, |_| 0);
    node_a.set_config(rev2.clone());
    node_c.set_config(rev2);

    let result = in_flight
        .await
        .expect("task")
        .expect("request survives reconfig");
    assert_eq!(result.value.as_ref(), b"bar");
    assert_eq!(node_a.count(Opcode::GET), 1);
    assert_eq!(agent.topology().rev, 2);
    assert_eq!(agent.topology().kv_endpoints, vec![node_a.addr_string()]);
    agent.close().await;
}
