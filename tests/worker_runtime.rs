/*
 *  Copyright 2025 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! End-to-end worker runtime tests driving real shell commands.

#![cfg(unix)]

mod fixtures;

use std::time::Duration;

use fixtures::{fast_builder, fixture, fixture_with, TestFixture};
use queuectl::{
    EnqueueRequest, Job, JobQueue, JobState, QueueError, ShutdownHandle, Worker, WorkerId,
};

fn spawn_worker(
    fx: &TestFixture,
) -> (
    ShutdownHandle,
    tokio::task::JoinHandle<Result<(), QueueError>>,
) {
    let worker = Worker::new(&fx.database, fx.config.clone());
    let shutdown = worker.shutdown_handle();
    (shutdown, tokio::spawn(worker.run()))
}

async fn wait_for_state(queue: &JobQueue, id: &str, state: JobState, timeout: Duration) -> Job {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let job = queue.job(id).expect("job lookup");
        if job.state == state {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {id} stuck in {} while waiting for {state}",
            job.state
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn happy_path_executes_and_captures_output() {
    let fx = fixture();
    let queue = fx.queue();

    queue
        .enqueue(EnqueueRequest::new("hello", "echo hi"))
        .expect("enqueue");

    let (shutdown, handle) = spawn_worker(&fx);
    let job = wait_for_state(&queue, "hello", JobState::Completed, Duration::from_secs(5)).await;

    assert_eq!(job.output.as_deref(), Some("hi"));
    assert_eq!(job.attempts, 0);
    assert!(job.locked_by.is_none());
    assert!(job.locked_at.is_none());

    shutdown.request();
    handle.await.expect("worker task").expect("worker run");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failure_captures_stderr_and_dead_letters_at_ceiling_zero() {
    let fx = fixture();
    let queue = fx.queue();

    queue
        .enqueue(EnqueueRequest::new("broken", "echo boom >&2; exit 3").max_retries(0))
        .expect("enqueue");

    let (shutdown, handle) = spawn_worker(&fx);
    let job = wait_for_state(&queue, "broken", JobState::Dead, Duration::from_secs(5)).await;

    assert_eq!(job.attempts, 1);
    assert_eq!(job.error.as_deref(), Some("boom"));
    assert!(job.next_retry_at.is_none());
    assert_eq!(queue.dlq_list().expect("dlq").len(), 1);

    shutdown.request();
    handle.await.expect("worker task").expect("worker run");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn silent_failure_reports_the_exit_code() {
    let fx = fixture();
    let queue = fx.queue();

    queue
        .enqueue(EnqueueRequest::new("mute", "exit 7").max_retries(0))
        .expect("enqueue");

    let (shutdown, handle) = spawn_worker(&fx);
    let job = wait_for_state(&queue, "mute", JobState::Dead, Duration::from_secs(5)).await;
    assert_eq!(job.error.as_deref(), Some("command exited with code 7"));

    shutdown.request();
    handle.await.expect("worker task").expect("worker run");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_job_retries_after_backoff_and_succeeds() {
    let fx = fixture();
    let queue = fx.queue();

    // Fails the first execution, succeeds once the marker exists.
    let marker = fx.path().join("attempted");
    let command = format!(
        "if [ -e {marker} ]; then echo done; else touch {marker}; exit 1; fi",
        marker = marker.display()
    );
    queue
        .enqueue(EnqueueRequest::new("second-try", command))
        .expect("enqueue");

    let (shutdown, handle) = spawn_worker(&fx);

    // First execution fails and schedules a retry ~2s out.
    let failed = wait_for_state(&queue, "second-try", JobState::Failed, Duration::from_secs(5)).await;
    assert_eq!(failed.attempts, 1);
    assert!(failed.next_retry_at.is_some());

    // The retry runs after the backoff and completes; success does not
    // touch the attempt counter.
    let done =
        wait_for_state(&queue, "second-try", JobState::Completed, Duration::from_secs(10)).await;
    assert_eq!(done.attempts, 1);
    assert_eq!(done.output.as_deref(), Some("done"));

    shutdown.request();
    handle.await.expect("worker task").expect("worker run");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn always_failing_job_exhausts_into_the_dlq() {
    let fx = fixture();
    let queue = fx.queue();

    queue
        .enqueue(EnqueueRequest::new("hopeless", "exit 1").max_retries(1))
        .expect("enqueue");

    let (shutdown, handle) = spawn_worker(&fx);

    // Two executions: the initial one and a retry ~2s later.
    let job = wait_for_state(&queue, "hopeless", JobState::Dead, Duration::from_secs(10)).await;
    assert_eq!(job.attempts, 2);

    shutdown.request();
    handle.await.expect("worker task").expect("worker run");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn three_workers_split_three_jobs_without_overlap() {
    let fx = fixture();
    let queue = fx.queue();

    for i in 0..3 {
        queue
            .enqueue(EnqueueRequest::new(format!("parallel-{i}"), "sleep 1"))
            .expect("enqueue");
    }

    let workers: Vec<_> = (0..3).map(|_| spawn_worker(&fx)).collect();

    // Serial execution would need ~3s of sleep alone; parallel workers
    // finish well inside the window.
    let start = tokio::time::Instant::now();
    for i in 0..3 {
        let job = wait_for_state(
            &queue,
            &format!("parallel-{i}"),
            JobState::Completed,
            Duration::from_secs(6),
        )
        .await;
        // A second execution of the same job would have recorded a
        // failure or another attempt.
        assert_eq!(job.attempts, 0);
    }
    assert!(start.elapsed() < Duration::from_secs(6));

    for (shutdown, handle) in workers {
        shutdown.request();
        handle.await.expect("worker task").expect("worker run");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn timeout_kills_the_child_and_fails_the_job() {
    let fx = fixture_with(fast_builder().worker_timeout(Duration::from_secs(1)));
    let queue = fx.queue();

    queue
        .enqueue(EnqueueRequest::new("glacial", "sleep 30").max_retries(0))
        .expect("enqueue");

    let (shutdown, handle) = spawn_worker(&fx);
    let job = wait_for_state(&queue, "glacial", JobState::Dead, Duration::from_secs(8)).await;
    assert!(
        job.error.as_deref().unwrap_or("").contains("timed out"),
        "error should mention the timeout, got {:?}",
        job.error
    );

    shutdown.request();
    handle.await.expect("worker task").expect("worker run");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_drains_the_in_flight_job() {
    let fx = fixture();
    let queue = fx.queue();

    queue
        .enqueue(EnqueueRequest::new("draining", "sleep 1; echo finished"))
        .expect("enqueue");

    let (shutdown, handle) = spawn_worker(&fx);
    wait_for_state(&queue, "draining", JobState::Processing, Duration::from_secs(5)).await;

    // One signal mid-execution: the job still finishes and is reported.
    shutdown.request();
    handle.await.expect("worker task").expect("worker run");

    let job = queue.job("draining").expect("job");
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.output.as_deref(), Some("finished"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn double_signal_kills_the_child_and_reports_failure() {
    let fx = fixture();
    let queue = fx.queue();

    queue
        .enqueue(EnqueueRequest::new("stubborn", "sleep 30").max_retries(0))
        .expect("enqueue");

    let (shutdown, handle) = spawn_worker(&fx);
    wait_for_state(&queue, "stubborn", JobState::Processing, Duration::from_secs(5)).await;

    shutdown.request();
    shutdown.request();
    handle.await.expect("worker task").expect("worker run");

    let job = queue.job("stubborn").expect("job");
    assert_eq!(job.state, JobState::Dead);
    assert!(
        job.error
            .as_deref()
            .unwrap_or("")
            .contains("worker shutdown"),
        "error should mention the shutdown, got {:?}",
        job.error
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn crashed_workers_claim_is_reaped_and_the_job_recovers() {
    let fx = fixture();
    let queue = fx.queue();

    queue
        .enqueue(EnqueueRequest::new("survivor", "echo recovered"))
        .expect("enqueue");

    // Simulate a worker that claimed the job and then died: the row is
    // stuck in processing under a lock nobody will release.
    let casualty = WorkerId::new("crashed-worker");
    queue.claim(&casualty).expect("claim").expect("a job");
    fx.backdate_lock("survivor", Duration::from_secs(600));

    // A live worker reaps the stale lock on its next pass, reclaims the
    // job, and finishes it. The reap itself charges no attempt.
    let (shutdown, handle) = spawn_worker(&fx);
    let job = wait_for_state(&queue, "survivor", JobState::Completed, Duration::from_secs(5)).await;
    assert_eq!(job.attempts, 0);
    assert_eq!(job.output.as_deref(), Some("recovered"));

    shutdown.request();
    handle.await.expect("worker task").expect("worker run");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn oversized_output_is_truncated_with_a_marker() {
    let fx = fixture_with(fast_builder().output_cap(64));
    let queue = fx.queue();

    queue
        .enqueue(EnqueueRequest::new("chatty", "yes x | head -c 4096"))
        .expect("enqueue");

    let (shutdown, handle) = spawn_worker(&fx);
    let job = wait_for_state(&queue, "chatty", JobState::Completed, Duration::from_secs(5)).await;

    let output = job.output.expect("captured output");
    assert!(
        output.ends_with(queuectl::worker::TRUNCATION_MARKER),
        "expected truncation marker, got {output:?}"
    );
    // 64 bytes of payload plus the marker.
    assert!(output.len() <= 64 + queuectl::worker::TRUNCATION_MARKER.len());

    shutdown.request();
    handle.await.expect("worker task").expect("worker run");
}
