//! Commit lifecycle against a live fence waiter and recording backend.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::Receiver;

use common::{buffer, recv_event, wait_until, Harness, WINDOW};
use scanout_commit::commit::{
    Commit, CommitContext, CommitEvent, CommitMetadata, CommitState, CompletionSource,
};
use scanout_commit::memo::BufferMemoiser;
use scanout_commit::sequence::last_commit_id;
use scanout_commit::waiter::WaiterThread;
use scanout_core::backend::{PresentTiming, SwapchainFeedback};
use scanout_core::buffer::{ClientBuffer, DmabufAttributes, DmabufPlane};
use scanout_core::config::WaiterConfig;
use scanout_core::error::CommitError;
use scanout_core::fence::SoftwareFence;
use scanout_core::handle::{FramebufferId, PresentationFeedback, WindowSequence};

struct Fixture {
    h: Harness,
    ctx: Arc<CommitContext>,
    events: Receiver<CommitEvent>,
    // Dropped last: commits deregister from the waiter on destruction.
    _thread: WaiterThread,
}

impl Fixture {
    fn new() -> Self {
        Self::with_locking(true)
    }

    fn with_locking(lock_framebuffers: bool) -> Self {
        let h = Harness::new();
        let thread = WaiterThread::spawn(&WaiterConfig::default()).expect("spawn waiter");
        let memos = BufferMemoiser::new(h.backend.importer.clone(), h.backend.display.clone());
        let (tx, events) = crossbeam_channel::unbounded();
        let ctx = CommitContext::new(thread.waiter(), memos, h.backend.clone())
            .with_events(tx)
            .with_framebuffer_locking(lock_framebuffers);
        Self {
            h,
            ctx: Arc::new(ctx),
            events,
            _thread: thread,
        }
    }

    fn commit(&self, buffer: &ClientBuffer) -> Arc<Commit> {
        Commit::new(buffer, metadata(), &self.ctx).expect("commit")
    }
}

fn metadata() -> CommitMetadata {
    CommitMetadata {
        window: WINDOW,
        ..Default::default()
    }
}

fn metadata_with_feedback() -> CommitMetadata {
    CommitMetadata {
        window: WINDOW,
        pending_feedbacks: vec![PresentationFeedback(1), PresentationFeedback(2)],
        swapchain_feedback: Some(Arc::new(SwapchainFeedback {
            image_count: 3,
            ..Default::default()
        })),
        ..Default::default()
    }
}

#[test]
fn test_ready_signal_completes_commit() {
    let f = Fixture::new();
    let buf = buffer();
    let commit = f.commit(&buf);
    assert_eq!(commit.state(), CommitState::Pending);
    assert!(commit.is_fence_open());
    assert_eq!(commit.completion_source(), CompletionSource::Texture);

    let fence = f.h.fences.take_last();
    fence.signal().unwrap();

    match recv_event(&f.events) {
        CommitEvent::Completed {
            commit: id,
            window,
            wait_done_time,
            ..
        } => {
            assert_eq!(id, commit.id());
            assert_eq!(window, WINDOW);
            assert!(wait_done_time > 0);
            assert_eq!(commit.wait_done_time(), Some(wait_done_time));
        }
        other => panic!("expected Completed, got {:?}", other),
    }
    assert_eq!(commit.state(), CommitState::Completed);
    assert!(!commit.is_fence_open());

    let done = f.h.session.done.lock().clone();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].0, commit.id());
}

#[test]
fn test_fence_dropped_right_after_signal_completes_commit() {
    let f = Fixture::new();
    let buf = buffer();
    let commit = f.commit(&buf);

    let fence = f.h.fences.take_last();
    fence.signal().unwrap();
    drop(fence);

    match recv_event(&f.events) {
        CommitEvent::Completed { commit: id, .. } => assert_eq!(id, commit.id()),
        other => panic!("expected Completed, got {:?}", other),
    }
    assert_eq!(commit.state(), CommitState::Completed);
    assert!(commit.wait_done_time().is_some());
    assert_eq!(f.h.session.done.lock().len(), 1);
}

#[test]
fn test_hang_up_marks_commit_errored() {
    let f = Fixture::new();
    let buf = buffer();
    let commit = f.commit(&buf);

    f.h.fences.take_last().abandon();

    let event = recv_event(&f.events);
    assert_eq!(
        event,
        CommitEvent::HungUp {
            commit: commit.id(),
            window: WINDOW
        }
    );
    assert_eq!(commit.state(), CommitState::Errored);
    assert!(!commit.is_fence_open());
    assert!(commit.wait_done_time().is_none());
    assert!(f.h.session.done.lock().is_empty());
}

#[test]
fn test_close_fence_is_idempotent() {
    let f = Fixture::new();
    let buf = buffer();
    let commit = f.commit(&buf);
    let fence = f.h.fences.take_last();

    assert!(commit.close_fence());
    assert!(!commit.close_fence());
    assert!(f.ctx.memos().contains(buf.id()));

    fence.signal().unwrap();
    assert!(f.events.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(commit.state(), CommitState::Pending);
}

#[test]
fn test_immediate_destroy_releases_everything_once() {
    let f = Fixture::new();
    let buf = buffer();
    let commit = f.commit(&buf);
    let fb = commit.framebuffer();
    assert!(!fb.is_none());
    assert_eq!(f.h.display.locks_of(fb), 1);
    assert_eq!(buf.lock_count(), 2);

    drop(commit);

    assert_eq!(f.h.display.releases_of(fb), 1);
    assert_eq!(buf.lock_count(), 1);
    assert!(f.ctx.metrics().destroyed.load(Ordering::SeqCst) >= 1);

    // The signal was deregistered, so completing it later reaches nobody.
    f.h.fences.take_last().signal().unwrap();
    assert!(f.events.recv_timeout(Duration::from_millis(100)).is_err());

    // The memo's own reference goes with the buffer.
    drop(buf);
    assert_eq!(f.h.display.releases_of(fb), 2);
}

#[test]
fn test_later_commit_completing_first_shares_memo() {
    let f = Fixture::new();
    let buf = buffer();

    let a = f.commit(&buf);
    let fence_a = f.h.fences.take_last();
    let b = f.commit(&buf);
    let fence_b = f.h.fences.take_last();

    assert!(a.id() < b.id());
    assert!(a.memo().same_import(b.memo()));
    assert_eq!(f.h.importer.imports.load(Ordering::SeqCst), 1);

    fence_b.signal().unwrap();
    assert_eq!(recv_event(&f.events).commit(), b.id());
    fence_a.signal().unwrap();
    assert_eq!(recv_event(&f.events).commit(), a.id());

    let fb = a.framebuffer();
    assert_eq!(f.h.display.locks_of(fb), 2);
    drop(b);
    drop(a);
    assert!(wait_until(|| f.h.display.releases_of(fb) == 2));

    drop(buf);
    assert!(wait_until(|| f.h.display.releases_of(fb) == 3));
    assert!(f.ctx.memos().is_empty());
}

#[test]
fn test_commit_ids_strictly_increase() {
    let f = Fixture::new();
    let buf = buffer();
    let commits: Vec<_> = (0..32).map(|_| f.commit(&buf)).collect();

    for pair in commits.windows(2) {
        assert!(pair[0].id() < pair[1].id());
    }
    assert!(last_commit_id() >= commits[31].id());
}

#[test]
fn test_commit_ids_unique_across_threads() {
    let f = Arc::new(Fixture::new());
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let f = f.clone();
            thread::spawn(move || {
                let buf = buffer();
                (0..16).map(|_| f.commit(&buf).id()).collect::<Vec<_>>()
            })
        })
        .collect();

    let mut ids = Vec::new();
    for handle in handles {
        let per_thread = handle.join().unwrap();
        for pair in per_thread.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        ids.extend(per_thread);
    }
    let total = ids.len();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), total);
}

#[test]
fn test_dmabuf_buffer_waits_on_transfer_fence() {
    let f = Fixture::new();
    let (fence, plane_fd) = SoftwareFence::new().unwrap();
    let buf = ClientBuffer::with_dmabuf(DmabufAttributes {
        width: 256,
        height: 256,
        format: 0x3432_5258,
        modifier: 0,
        planes: vec![DmabufPlane {
            fd: plane_fd,
            offset: 0,
            stride: 1024,
        }],
    });

    let commit = f.commit(&buf);
    assert_eq!(commit.completion_source(), CompletionSource::Transfer);
    assert_eq!(f.h.fences.texture_exports.load(Ordering::SeqCst), 0);

    fence.signal().unwrap();
    assert!(matches!(recv_event(&f.events), CommitEvent::Completed { .. }));
    assert_eq!(commit.state(), CommitState::Completed);
}

#[test]
fn test_transfer_export_failure_falls_back_to_texture() {
    let f = Fixture::new();
    f.h.fences.fail_transfer.store(true, Ordering::SeqCst);
    let buf = buffer();

    let commit = f.commit(&buf);
    assert_eq!(commit.completion_source(), CompletionSource::Texture);
    assert_eq!(f.h.fences.texture_exports.load(Ordering::SeqCst), 1);
}

#[test]
fn test_fence_failure_fails_construction_cleanly() {
    let f = Fixture::new();
    f.h.fences.fail_texture.store(true, Ordering::SeqCst);
    let buf = buffer();

    let err = Commit::new(&buf, metadata(), &f.ctx).err().expect("construction fails");
    assert!(matches!(err, CommitError::FenceAcquisition(_)), "got {:?}", err);
    assert_eq!(f.h.display.lock_count(), 0);
    assert_eq!(buf.lock_count(), 1);
    // The memo survives for the next attempt.
    assert!(f.ctx.memos().contains(buf.id()));
}

#[test]
fn test_import_failure_fails_construction() {
    let f = Fixture::new();
    f.h.importer.fail.store(true, Ordering::SeqCst);
    let buf = buffer();

    let err = Commit::new(&buf, metadata(), &f.ctx).err().expect("construction fails");
    assert!(matches!(err, CommitError::Import(_)), "got {:?}", err);
    assert_eq!(buf.lock_count(), 1);
    assert!(f.ctx.memos().is_empty());
}

#[test]
fn test_presented_commit_delivers_feedback() {
    let f = Fixture::new();
    let buf = buffer();
    let commit = Commit::new(&buf, metadata_with_feedback(), &f.ctx).unwrap();
    let fence = f.h.fences.take_last();
    fence.signal().unwrap();
    recv_event(&f.events);

    let timing = PresentTiming {
        present_time: 1_000,
        refresh_cycle: 16_666_666,
    };
    assert!(commit.mark_presented(timing));
    assert!(!commit.mark_presented(timing));
    assert_eq!(commit.presented(), Some(timing));
    drop(commit);

    assert!(wait_until(|| f.h.feedback.delivered.lock().len() == 1));
    let delivered = f.h.feedback.delivered.lock();
    let (window, feedbacks, swapchain, got) = &delivered[0];
    assert_eq!(*window, WINDOW);
    assert_eq!(feedbacks, &vec![PresentationFeedback(1), PresentationFeedback(2)]);
    assert!(*swapchain);
    assert_eq!(*got, timing);
    assert!(f.h.feedback.discarded.lock().is_empty());
}

#[test]
fn test_unpresented_commit_discards_feedback() {
    let f = Fixture::new();
    let buf = buffer();
    let commit = Commit::new(&buf, metadata_with_feedback(), &f.ctx).unwrap();
    drop(commit);

    let discarded = f.h.feedback.discarded.lock();
    assert_eq!(discarded.len(), 1);
    assert_eq!(discarded[0].1.len(), 2);
    assert!(f.h.feedback.delivered.lock().is_empty());
}

#[test]
fn test_commit_without_feedback_reports_nothing() {
    let f = Fixture::new();
    let buf = buffer();
    drop(f.commit(&buf));

    assert!(f.h.feedback.discarded.lock().is_empty());
    assert!(f.h.feedback.delivered.lock().is_empty());
}

#[test]
fn test_frame_time_measures_against_previous_completion() {
    let f = Fixture::new();
    let buf = buffer();

    let first = f.commit(&buf);
    f.h.fences.take_last().signal().unwrap();
    recv_event(&f.events);
    assert!(first.frame_time().is_none());

    thread::sleep(Duration::from_millis(2));

    let second = f.commit(&buf);
    f.h.fences.take_last().signal().unwrap();
    match recv_event(&f.events) {
        CommitEvent::Completed { frame_time, .. } => {
            assert!(frame_time.is_some());
            assert_eq!(second.frame_time(), frame_time);
        }
        other => panic!("expected Completed, got {:?}", other),
    }
}

#[test]
fn test_unknown_window_completes_silently() {
    let f = Fixture::new();
    let buf = buffer();
    let commit = Commit::new(
        &buf,
        CommitMetadata {
            window: WindowSequence(999),
            ..Default::default()
        },
        &f.ctx,
    )
    .unwrap();

    f.h.fences.take_last().signal().unwrap();
    match recv_event(&f.events) {
        CommitEvent::Completed { frame_time, .. } => assert!(frame_time.is_none()),
        other => panic!("expected Completed, got {:?}", other),
    }
    assert_eq!(commit.state(), CommitState::Completed);
    assert!(f.h.session.done.lock().is_empty());
}

#[test]
fn test_framebuffer_locking_disabled() {
    let f = Fixture::with_locking(false);
    let buf = buffer();
    let commit = f.commit(&buf);

    assert_eq!(commit.framebuffer(), FramebufferId::NONE);
    assert!(!commit.memo().framebuffer().is_none());
    drop(commit);
    assert_eq!(f.h.display.lock_count(), 0);
    assert_eq!(f.h.display.release_count(), 0);
}

#[test]
fn test_interleaved_completion_and_destroy_release_exactly_once() {
    let f = Fixture::new();
    let buf = buffer();

    let mut commits = Vec::new();
    let mut fences = Vec::new();
    for _ in 0..64 {
        commits.push(f.commit(&buf));
        fences.push(f.h.fences.take_last());
    }
    let fb = commits[0].framebuffer();

    let signaler = thread::spawn(move || {
        for (i, fence) in fences.iter().enumerate() {
            if i % 3 == 0 {
                // Every third commit is destroyed while still pending.
                continue;
            }
            fence.signal().unwrap();
        }
        thread::sleep(Duration::from_millis(50));
        fences
    });
    let destroyer = thread::spawn(move || {
        for commit in commits.into_iter().rev() {
            drop(commit);
        }
    });

    destroyer.join().unwrap();
    let fences = signaler.join().unwrap();

    assert!(wait_until(|| f.h.display.releases_of(fb) == 64));
    assert!(f.ctx.memos().contains(buf.id()));
    assert_eq!(f.h.display.locks_of(fb), 64);
    assert_eq!(buf.lock_count(), 1);

    drop(fences);
    drop(buf);
    assert!(wait_until(|| f.h.display.releases_of(fb) == 65));
}
