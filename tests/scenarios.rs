//! End-to-end scenarios driving a manager over real sockets with scripted
//! workers.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use dataswarm::{
    AllocationMode, CatalogClient, FactoryUpdate, Manager, ManagerConfig, ResourceRequest, Task,
    TaskResult, TaskState,
};

const HANDSHAKE: &str = "dataswarm 10 HOST linux x86_64 7.7.7\n\
                         resource workers 1 1 1\n\
                         resource cores 4 4 4\n\
                         resource memory 4096 4096 4096\n\
                         resource disk 40960 40960 40960\n\
                         resource gpus 0 0 0\n\
                         info end_of_resource_update 0\n";

fn test_config() -> ManagerConfig {
    let mut cfg = ManagerConfig::default();
    cfg.short_timeout = Duration::from_secs(1);
    cfg
}

async fn connect_worker(port: u16, host: &str) -> TcpStream {
    let mut s = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    s.write_all(HANDSHAKE.replace("HOST", host).as_bytes())
        .await
        .unwrap();
    s
}

/// Reads from the worker socket until a full `task ... end` block arrived.
async fn read_task_block(s: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let deadline = Duration::from_secs(10);
    timeout(deadline, async {
        loop {
            let mut chunk = [0u8; 4096];
            let n = s.read(&mut chunk).await.unwrap();
            assert!(n > 0, "manager closed the connection mid-block");
            buf.extend_from_slice(&chunk[..n]);
            if buf.ends_with(b"end\n") {
                break;
            }
        }
    })
    .await
    .expect("no task block within deadline");
    String::from_utf8_lossy(&buf).into_owned()
}

/// Drives `wait` until a task comes back, bounded by `turns` short waits.
async fn wait_for_completion(m: &mut Manager, turns: usize) -> Option<Task> {
    for _ in 0..turns {
        if let Some(t) = m.wait(Some(Duration::from_millis(250))).await {
            return Some(t);
        }
    }
    None
}

/// Drives `wait` until the predicate holds.
async fn wait_until(m: &mut Manager, turns: usize, mut done: impl FnMut(&mut Manager) -> bool) {
    for _ in 0..turns {
        if done(m) {
            return;
        }
        let _ = m.wait(Some(Duration::from_millis(100))).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn s1_happy_path() {
    let mut m = Manager::bind(test_config()).await.unwrap();
    let port = m.port();

    let worker = tokio::spawn(async move {
        let mut s = connect_worker(port, "host1").await;
        let block = read_task_block(&mut s).await;
        assert!(block.starts_with("task 1\n"));
        assert!(block.contains("category default\n"));
        assert!(block.ends_with("end\n"));
        s.write_all(b"result 0 0 0 100 1\nend\n").await.unwrap();
        // Stay connected until the manager is done with us.
        let mut sink = [0u8; 1024];
        loop {
            match s.read(&mut sink).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    });

    let id = m.submit(Task::new("/bin/true")).unwrap();
    assert_eq!(id, 1);

    let done = wait_for_completion(&mut m, 40).await.expect("task completes");
    assert_eq!(done.taskid, 1);
    assert_eq!(done.result, TaskResult::Success);
    assert_eq!(done.exit_code, 0);
    assert_eq!(done.state, TaskState::Done);
    assert!(m.empty());

    m.shutdown().await;
    worker.await.unwrap();
}

#[tokio::test]
async fn s2_worker_disappears_mid_run() {
    let mut m = Manager::bind(test_config()).await.unwrap();
    let port = m.port();

    let first = tokio::spawn(async move {
        let mut s = connect_worker(port, "host1").await;
        let _block = read_task_block(&mut s).await;
        // Vanish without a word.
        drop(s);
    });

    let id = m.submit(Task::new("/bin/true")).unwrap();

    // The first worker takes the task, then vanishes; the manager notices
    // and puts the task back on the ready queue.
    wait_until(&mut m, 50, |m| m.task_state(id) == TaskState::Ready).await;
    first.await.unwrap();

    // A second worker picks the retry up.
    let second = tokio::spawn(async move {
        let mut s = connect_worker(port, "host2").await;
        let block = read_task_block(&mut s).await;
        let taskid: u64 = block
            .lines()
            .next()
            .unwrap()
            .strip_prefix("task ")
            .unwrap()
            .parse()
            .unwrap();
        s.write_all(format!("result 0 0 0 100 {taskid}\nend\n").as_bytes())
            .await
            .unwrap();
        let mut sink = [0u8; 1024];
        loop {
            match s.read(&mut sink).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    });

    let done = wait_for_completion(&mut m, 40).await.expect("retry completes");
    assert_eq!(done.taskid, id);
    // One attempt died with the first worker, the second one finished.
    assert_eq!(done.try_count, 2);
    assert_eq!(done.result, TaskResult::Success);

    m.shutdown().await;
    second.await.unwrap();
}

#[tokio::test]
async fn s3_resource_exhaustion_grows_then_fails() {
    let mut m = Manager::bind(test_config()).await.unwrap();
    let port = m.port();

    m.set_category_mode(Some("hungry"), AllocationMode::MaxThroughput);
    m.set_category_max_resources(
        "hungry",
        ResourceRequest {
            cores: Some(4),
            memory: Some(8192),
            ..Default::default()
        },
    );
    m.set_category_first_allocation_guess(
        "hungry",
        ResourceRequest {
            cores: Some(1),
            memory: Some(1024),
            ..Default::default()
        },
    );

    let worker = tokio::spawn(async move {
        let mut s = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        s.write_all(
            "dataswarm 10 bighost linux x86_64 7.7.7\n\
             resource workers 1 1 1\n\
             resource cores 8 8 8\n\
             resource memory 16384 16384 16384\n\
             resource disk 40960 40960 40960\n\
             resource gpus 0 0 0\n\
             info end_of_resource_update 0\n"
                .as_bytes(),
        )
        .await
        .unwrap();

        // First attempt: small box, exhausted (wire code 16).
        let block = read_task_block(&mut s).await;
        assert!(block.contains("cores 1\n"), "first block was:\n{block}");
        assert!(block.contains("memory 1024\n"));
        s.write_all(b"result 16 147 0 100 1\nend\n").await.unwrap();

        // Second attempt arrives with the category maximum.
        let block = read_task_block(&mut s).await;
        assert!(block.contains("cores 4\n"), "second block was:\n{block}");
        assert!(block.contains("memory 8192\n"));
        s.write_all(b"result 16 147 0 100 1\nend\n").await.unwrap();

        let mut sink = [0u8; 1024];
        loop {
            match s.read(&mut sink).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    });

    m.submit(Task::new("/bin/hog").with_category("hungry")).unwrap();

    let done = wait_for_completion(&mut m, 80).await.expect("task settles");
    assert_eq!(done.result, TaskResult::ResourceExhaustion);
    assert_eq!(done.state, TaskState::Done);
    assert_eq!(done.exhausted_attempts, 2);
    assert_eq!(done.try_count, 2);

    m.shutdown().await;
    worker.await.unwrap();
}

#[tokio::test]
async fn tuned_min_waste_category_grows_through_public_api() {
    let mut m = Manager::bind(test_config()).await.unwrap();
    let port = m.port();

    // Everything below goes through the public surface: tuning knobs,
    // the task-id floor, and a growing (non-fixed) category.
    m.tune("force-proportional-resources", 1.0).unwrap();
    m.tune("wait-for-workers", 1.0).unwrap();
    assert_eq!(m.set_min_taskid(100), 100);

    m.set_category_mode(Some("frugal"), AllocationMode::MinWaste);
    m.set_category_max_resources(
        "frugal",
        ResourceRequest {
            cores: Some(2),
            memory: Some(2048),
            ..Default::default()
        },
    );
    m.set_category_first_allocation_guess(
        "frugal",
        ResourceRequest {
            cores: Some(1),
            memory: Some(1024),
            ..Default::default()
        },
    );

    let worker = tokio::spawn(async move {
        let mut s = connect_worker(port, "prophost").await;

        // First attempt: the first-allocation guess, divided proportionally
        // across the worker (a quarter of its 4 cores, so a quarter of its
        // 40960 MB disk too; without force-proportional the task would get
        // the whole disk).
        let block = read_task_block(&mut s).await;
        assert!(block.starts_with("task 100\n"), "first block was:\n{block}");
        assert!(block.contains("cores 1\n"));
        assert!(block.contains("memory 1024\n"));
        assert!(block.contains("disk 10240\n"));
        s.write_all(b"result 16 147 0 100 100\nend\n").await.unwrap();

        // The exhausted task comes back under the category maximum: half
        // the worker this time.
        let block = read_task_block(&mut s).await;
        assert!(block.contains("cores 2\n"), "second block was:\n{block}");
        assert!(block.contains("memory 2048\n"));
        assert!(block.contains("disk 20480\n"));
        s.write_all(b"result 0 0 0 100 100\nend\n").await.unwrap();

        let mut sink = [0u8; 1024];
        loop {
            match s.read(&mut sink).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    });

    let id = m
        .submit(Task::new("/bin/frugal").with_category("frugal"))
        .unwrap();
    assert_eq!(id, 100);

    let done = wait_for_completion(&mut m, 80).await.expect("task settles");
    assert_eq!(done.taskid, 100);
    assert_eq!(done.result, TaskResult::Success);
    assert_eq!(done.try_count, 2);
    assert_eq!(done.exhausted_attempts, 1);

    m.shutdown().await;
    worker.await.unwrap();
}

#[tokio::test]
async fn s4_fast_abort_blocks_repeatedly_slow_worker() {
    let mut m = Manager::bind(test_config()).await.unwrap();
    let port = m.port();
    m.activate_fast_abort(2.0);

    let worker = tokio::spawn(async move {
        let mut s = connect_worker(port, "slowhost").await;

        // Ten quick successes to establish the category average.
        for _ in 0..10 {
            let block = read_task_block(&mut s).await;
            let taskid: u64 = block
                .lines()
                .next()
                .unwrap()
                .strip_prefix("task ")
                .unwrap()
                .parse()
                .unwrap();
            s.write_all(format!("result 0 0 0 1000000 {taskid}\nend\n").as_bytes())
                .await
                .unwrap();
        }

        // Two more tasks arrive and we sit on them silently.
        let _ = read_task_block(&mut s).await;
        let _ = read_task_block(&mut s).await;
        let mut sink = [0u8; 4096];
        loop {
            match s.read(&mut sink).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    });

    // One at a time, so the worker script sees exactly one block per turn.
    for _ in 0..10 {
        m.submit(Task::new("/bin/quick").with_cores(1)).unwrap();
        wait_for_completion(&mut m, 40).await.expect("warmup task");
    }

    let a = m.submit(Task::new("/bin/slow-a").with_cores(1)).unwrap();
    let b = m.submit(Task::new("/bin/slow-b").with_cores(1)).unwrap();

    wait_until(&mut m, 50, |m| {
        m.task_state(a) == TaskState::Running && m.task_state(b) == TaskState::Running
    })
    .await;

    // Let both runtimes comfortably exceed the category average.
    tokio::time::sleep(Duration::from_millis(300)).await;

    wait_until(&mut m, 50, |m| m.stats().workers_fast_aborted == 1).await;

    // Both tasks went back to ready and the slow host is banned.
    assert_eq!(m.task_state(a), TaskState::Ready);
    assert_eq!(m.task_state(b), TaskState::Ready);
    assert_eq!(m.stats().workers_connected, 0);

    // The banned host cannot register again while the ban lives.
    let rejoin = tokio::spawn(async move {
        let mut s = connect_worker(port, "slowhost").await;
        let mut sink = [0u8; 256];
        let _ = s.read(&mut sink).await;
    });
    let _ = m.wait(Some(Duration::from_millis(300))).await;
    assert_eq!(m.stats().workers_connected, 0);

    m.shutdown().await;
    let _ = worker.await;
    let _ = rejoin.await;
}

#[tokio::test]
async fn s5_http_status_endpoint() {
    let mut m = Manager::bind(test_config()).await.unwrap();
    let port = m.port();
    m.submit(Task::new("/bin/true")).unwrap();

    let client = tokio::spawn(async move {
        let mut s = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        s.write_all(b"GET /queue_status HTTP/1.0\r\n\r\n").await.unwrap();
        let mut body = Vec::new();
        s.read_to_end(&mut body).await.unwrap();
        String::from_utf8_lossy(&body).into_owned()
    });

    // A few turns to accept, read, and answer the request.
    for _ in 0..20 {
        if client.is_finished() {
            break;
        }
        let _ = m.wait(Some(Duration::from_millis(100))).await;
    }

    let response = client.await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.contains("Content-type: text/plain"));

    let json_start = response.find("\n\n").unwrap() + 2;
    let v: Value = serde_json::from_str(response[json_start..].trim()).unwrap();
    let q = &v[0];
    assert_eq!(q["type"], "ds_master");
    assert_eq!(q["port"], u64::from(port));
    assert_eq!(q["tasks_waiting"], 1);
    assert_eq!(q["tasks_running"], 0);
    assert_eq!(q["workers_connected"], 0);

    m.shutdown().await;
}

struct StaticCatalog;

#[async_trait]
impl CatalogClient for StaticCatalog {
    async fn send_update(&self, _record: &Value) -> bool {
        true
    }

    async fn fetch_factories(&self, _names: &[String]) -> Vec<FactoryUpdate> {
        Vec::new()
    }
}

#[tokio::test]
async fn s6_factory_trim_spares_busy_workers() {
    let mut m = Manager::bind(test_config()).await.unwrap();
    let port = m.port();
    m.set_catalog_servers("catalog.example:9097", std::sync::Arc::new(StaticCatalog));

    // Three idle workers from the same factory.
    let mut sockets = Vec::new();
    for i in 0..3 {
        let mut s = connect_worker(port, &format!("fhost{i}")).await;
        s.write_all(b"info from-factory f\n").await.unwrap();
        sockets.push(s);
    }

    wait_until(&mut m, 50, |m| m.stats().workers_connected == 3).await;

    // Make the first worker busy.
    let id = m.submit(Task::new("/bin/busy").with_cores(1)).unwrap();
    wait_until(&mut m, 50, |m| m.task_state(id) == TaskState::Running).await;

    // The factory shrinks to one worker: exactly the two idle ones go.
    m.update_factories(vec![FactoryUpdate {
        factory_name: "f".to_string(),
        max_workers: Some(1),
    }])
    .await;

    assert_eq!(m.stats().workers_connected, 1);
    assert_eq!(m.task_state(id), TaskState::Running);

    // The retired workers were told to exit.
    let mut exits = 0;
    for mut s in sockets {
        let mut buf = Vec::new();
        let _ = timeout(Duration::from_millis(500), s.read_to_end(&mut buf)).await;
        if String::from_utf8_lossy(&buf).contains("exit\n") {
            exits += 1;
        }
    }
    assert_eq!(exits, 2);

    m.shutdown().await;
}

#[tokio::test]
async fn unidentified_worker_is_removed_after_keepalive_timeout() {
    let mut m = Manager::bind(test_config()).await.unwrap();
    m.tune("keepalive-timeout", 1.0).unwrap();
    let port = m.port();

    // Connect but never speak.
    let silent = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

    wait_until(&mut m, 30, |m| m.stats().workers_init == 1).await;
    tokio::time::sleep(Duration::from_millis(1100)).await;
    wait_until(&mut m, 30, |m| m.stats().workers_init == 0).await;

    drop(silent);
    m.shutdown().await;
}

#[tokio::test]
async fn ready_tasks_expire_on_deadline_and_retry_budget() {
    let mut m = Manager::bind(test_config()).await.unwrap();

    // An absolute end time already in the past.
    let id = m.submit(Task::new("/bin/late").with_end_time(1)).unwrap();
    let done = wait_for_completion(&mut m, 20).await.expect("expired task returns");
    assert_eq!(done.taskid, id);
    assert_eq!(done.result, TaskResult::TaskTimeout);

    m.shutdown().await;
}

#[tokio::test]
async fn watched_output_updates_are_spliced_into_local_file() {
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("watched.out");
    let local_str = local.to_str().unwrap().to_string();

    let mut m = Manager::bind(test_config()).await.unwrap();
    let port = m.port();

    let worker = tokio::spawn(async move {
        let mut s = connect_worker(port, "host1").await;
        let block = read_task_block(&mut s).await;
        assert!(block.contains("outfile "));

        // Two appends to the watched file, then completion.
        s.write_all(b"update 1 watched.out 0 6\nhello\n").await.unwrap();
        s.write_all(b"update 1 watched.out 6 6\nworld\n").await.unwrap();
        s.write_all(b"result 0 0 0 100 1\nend\n").await.unwrap();
        let mut sink = [0u8; 1024];
        loop {
            match s.read(&mut sink).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    });

    m.submit(
        Task::new("/bin/logger").with_output_file(
            &local_str,
            "watched.out",
            dataswarm::FileFlags {
                cache: false,
                watch: true,
            },
        ),
    )
    .unwrap();

    let done = wait_for_completion(&mut m, 40).await.expect("task completes");
    assert_eq!(done.result, TaskResult::Success);

    let content = std::fs::read(&local).unwrap();
    assert_eq!(&content, b"hello\nworld\n");

    m.shutdown().await;
    worker.await.unwrap();
}

#[tokio::test]
async fn stdout_is_captured_and_truncated_with_marker() {
    let mut cfg = test_config();
    cfg.max_stdout_storage = 256;
    let mut m = Manager::bind(cfg).await.unwrap();
    let port = m.port();

    let worker = tokio::spawn(async move {
        let mut s = connect_worker(port, "host1").await;
        let _ = read_task_block(&mut s).await;

        // 1000 bytes of stdout against a 256-byte cap.
        let payload = vec![b'x'; 1000];
        s.write_all(format!("result 0 0 {} 100 1\n", payload.len()).as_bytes())
            .await
            .unwrap();
        s.write_all(&payload).await.unwrap();
        s.write_all(b"end\n").await.unwrap();
        let mut sink = [0u8; 1024];
        loop {
            match s.read(&mut sink).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    });

    m.submit(Task::new("/bin/yes")).unwrap();
    let done = wait_for_completion(&mut m, 40).await.expect("task completes");

    assert_eq!(done.output.len(), 256);
    let text = String::from_utf8_lossy(&done.output);
    assert!(text.ends_with("BYTES TRUNCATED."), "tail was: {text}");

    m.shutdown().await;
    worker.await.unwrap();
}

#[tokio::test]
async fn cancel_by_taskid_kills_running_task() {
    let mut m = Manager::bind(test_config()).await.unwrap();
    let port = m.port();

    let worker = tokio::spawn(async move {
        let mut s = connect_worker(port, "host1").await;
        let _ = read_task_block(&mut s).await;
        // Wait for the kill message.
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            match s.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    if String::from_utf8_lossy(&buf).contains("kill 1\n") {
                        break;
                    }
                }
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    });

    let id = m.submit(Task::new("/bin/sleepy")).unwrap();
    wait_until(&mut m, 50, |m| m.task_state(id) == TaskState::Running).await;

    let cancelled = m.cancel_by_taskid(id).await.expect("task returned");
    assert_eq!(cancelled.state, TaskState::Canceled);
    assert_eq!(m.task_state(id), TaskState::Unknown);

    let seen = worker.await.unwrap();
    assert!(seen.contains("kill 1\n"));

    m.shutdown().await;
}
