use crate::message::Priority;
use crate::{Error, Result};

use priority_queue::PriorityQueue;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const PRIORITY_WEIGHT: i64 = 1000;
const SIZE_WEIGHT: i64 = 10;
/// Score lost by requests for every grant made before they were enqueued.
const AGING_WEIGHT: i64 = 100;

type Ticket = u64;

/// Higher scores are granted first. The score of a request is fixed when it is enqueued;
/// requests arriving later start from a lower base, which bounds how many later requests
/// can overtake an earlier one.
fn score(priority: Priority, size: usize, round: u64) -> i64 {
    let magnitude = 64 - (size as u64).leading_zeros() as i64;
    priority.bits() as i64 * PRIORITY_WEIGHT + magnitude * SIZE_WEIGHT
        - (round as i64).saturating_mul(AGING_WEIGHT)
}

struct Waiter {
    size: usize,
    grant: oneshot::Sender<()>,
}

#[derive(Default)]
struct FlowState {
    load: usize,
    queue: PriorityQueue<Ticket, (i64, Reverse<Ticket>)>,
    waiters: HashMap<Ticket, Waiter>,
    next_ticket: Ticket,
    /// Number of grants so far.
    round: u64,
}

pub struct FlowController {
    window: usize,
    state: Mutex<FlowState>,
    idle: Notify,
}

impl FlowController {
    pub fn new(window: usize) -> Self {
        FlowController { window: window.max(1), state: Mutex::new(FlowState::default()), idle: Notify::new() }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn current_load(&self) -> usize {
        self.state().load
    }

    pub fn queued(&self) -> usize {
        self.state().queue.len()
    }

    fn state(&self) -> MutexGuard<'_, FlowState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Requests `size` bytes of budget, waiting until it is granted, `cancel` fires or
    /// `deadline` passes. Sizes above the window are clamped to the window.
    pub async fn acquire(
        self: &Arc<Self>,
        size: usize,
        priority: Priority,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<Permit> {
        self.enqueue(size, priority).wait(cancel, deadline).await
    }

    /// Non-blocking variant of [FlowController::acquire].
    pub fn try_acquire(self: &Arc<Self>, size: usize, _priority: Priority) -> Result<Permit> {
        let size = size.min(self.window);
        let mut state = self.state();
        let available = self.window - state.load;
        if !state.queue.is_empty() || size > available {
            return Err(Error::InsufficientFlowBudget { requested: size, available });
        }
        state.load += size;
        state.round += 1;
        Ok(Permit { controller: self.clone(), remaining: size })
    }

    /// Places a request in the queue, granting it right away when nothing is waiting and
    /// the budget allows.
    pub fn enqueue(self: &Arc<Self>, size: usize, priority: Priority) -> Pending {
        let size = size.min(self.window);
        let mut state = self.state();
        if state.queue.is_empty() && state.load + size <= self.window {
            state.load += size;
            state.round += 1;
            return Pending { controller: self.clone(), ticket: None, size, grant: None, settled: false };
        }
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        let (tx, rx) = oneshot::channel();
        let priority = (score(priority, size, state.round), Reverse(ticket));
        state.queue.push(ticket, priority);
        state.waiters.insert(ticket, Waiter { size, grant: tx });
        debug!("flow> queued {} bytes (load {}/{})", size, state.load, self.window);
        Pending { controller: self.clone(), ticket: Some(ticket), size, grant: Some(rx), settled: false }
    }

    fn release(&self, size: usize) {
        if size == 0 {
            return;
        }
        let mut state = self.state();
        state.load = state.load.saturating_sub(size);
        self.grant_waiting(&mut state);
    }

    /// Grants queued requests from the head while they fit. A head that does not fit
    /// blocks everything behind it.
    fn grant_waiting(&self, state: &mut FlowState) {
        loop {
            let ticket = match state.queue.peek() {
                Some((ticket, _)) => *ticket,
                None => break,
            };
            let size = match state.waiters.get(&ticket) {
                Some(waiter) => waiter.size,
                None => {
                    state.queue.pop();
                    continue;
                }
            };
            if state.load + size > self.window {
                break;
            }
            state.queue.pop();
            if let Some(waiter) = state.waiters.remove(&ticket) {
                state.round += 1;
                if waiter.grant.send(()).is_ok() {
                    state.load += size;
                }
            }
        }
        if state.load == 0 {
            self.idle.notify_waiters();
        }
    }

    /// Withdraws a request. If it was granted in the meantime the budget goes back.
    fn abandon(&self, ticket: Ticket, size: usize) {
        let mut state = self.state();
        if state.waiters.remove(&ticket).is_some() {
            state.queue.remove(&ticket);
        } else {
            state.load = state.load.saturating_sub(size);
        }
        self.grant_waiting(&mut state);
    }

    /// Resolves once no budget is in use.
    pub async fn idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.current_load() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// A request that has been queued but not necessarily granted. Dropping it withdraws the
/// request and returns any budget granted to it.
pub struct Pending {
    controller: Arc<FlowController>,
    ticket: Option<Ticket>,
    size: usize,
    grant: Option<oneshot::Receiver<()>>,
    settled: bool,
}

impl Pending {
    fn into_permit(mut self) -> Permit {
        self.settled = true;
        Permit { controller: self.controller.clone(), remaining: self.size }
    }

    /// Returns the permit if the request has been granted.
    pub fn try_wait(mut self) -> std::result::Result<Permit, Pending> {
        let granted = match self.grant.as_mut() {
            None => true,
            Some(grant) => grant.try_recv().is_ok(),
        };
        if granted {
            Ok(self.into_permit())
        } else {
            Err(self)
        }
    }

    pub async fn wait(mut self, cancel: &CancellationToken, deadline: Option<Instant>) -> Result<Permit> {
        let grant = match self.grant.take() {
            None => return Ok(self.into_permit()),
            Some(grant) => grant,
        };
        let expired = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => futures::future::pending().await,
            }
        };
        tokio::select! {
            granted = grant => match granted {
                Ok(()) => Ok(self.into_permit()),
                Err(_) => Err(Error::Cancelled),
            },
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = expired => Err(Error::DeadlineExceeded),
        }
    }
}

impl Drop for Pending {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        match self.ticket {
            Some(ticket) => self.controller.abandon(ticket, self.size),
            None => self.controller.release(self.size),
        }
    }
}

/// Budget held by one transfer. Unreleased budget is returned on drop.
pub struct Permit {
    controller: Arc<FlowController>,
    remaining: usize,
}

impl Permit {
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Returns up to `size` bytes of this permit to the controller.
    pub fn release(&mut self, size: usize) {
        let size = size.min(self.remaining);
        self.remaining -= size;
        self.controller.release(size);
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        let remaining = self.remaining;
        self.remaining = 0;
        self.controller.release(remaining);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn larger_and_more_urgent_requests_score_higher() {
        assert!(score(Priority::High, 1, 0) > score(Priority::Low, 1 << 20, 0));
        assert!(score(Priority::Normal, 1 << 20, 0) > score(Priority::Normal, 16, 0));
        assert!(score(Priority::Normal, 16, 0) > score(Priority::Normal, 16, 1));
    }

    #[test]
    fn oversize_requests_are_clamped() {
        let flow = Arc::new(FlowController::new(100));
        let permit = flow.try_acquire(1000, Priority::Normal).unwrap();
        assert_eq!(permit.remaining(), 100);
        assert_eq!(flow.current_load(), 100);
        drop(permit);
        assert_eq!(flow.current_load(), 0);
    }

    #[test]
    fn try_acquire_reports_budget() {
        let flow = Arc::new(FlowController::new(10));
        let _held = flow.try_acquire(8, Priority::Normal).unwrap();
        match flow.try_acquire(5, Priority::High) {
            Err(Error::InsufficientFlowBudget { requested: 5, available: 2 }) => (),
            Err(e) => panic!("unexpected {:?}", e),
            Ok(_) => panic!("window exceeded"),
        }
    }

    #[test]
    fn release_grants_in_priority_order() {
        let flow = Arc::new(FlowController::new(10));
        let mut held = flow.try_acquire(10, Priority::Normal).unwrap();
        let low = flow.enqueue(4, Priority::Low);
        let high = flow.enqueue(4, Priority::High);
        held.release(4);
        let low = low.try_wait().err().unwrap();
        let _high = high.try_wait().ok().unwrap();
        assert_eq!(flow.current_load(), 10);
        held.release(6);
        let _low = low.try_wait().ok().unwrap();
        assert_eq!(flow.current_load(), 8);
    }

    #[test]
    fn large_request_is_not_starved_by_small_urgent_ones() {
        let flow = Arc::new(FlowController::new(64));
        let mut held = flow.try_acquire(64, Priority::High).unwrap();
        let large = flow.enqueue(64, Priority::Low);
        let mut smalls = vec![];
        let mut overtaken = 0;
        loop {
            let small = flow.enqueue(1, Priority::High);
            held.release(1);
            match small.try_wait() {
                Ok(permit) => smalls.push(permit),
                Err(_) => break,
            }
            overtaken += 1;
            assert!(overtaken < 32, "large request starved");
            assert!(flow.current_load() <= flow.window());
        }
        drop(smalls);
        drop(held);
        let granted = large.try_wait();
        assert!(granted.is_ok(), "large request not granted after the window drained");
        assert_eq!(flow.current_load(), 64);
    }

    #[actix_rt::test]
    async fn cancellation_returns_budget() {
        let flow = Arc::new(FlowController::new(10));
        let held = flow.try_acquire(10, Priority::Normal).unwrap();
        let cancel = CancellationToken::new();
        let waiting = {
            let flow = flow.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { flow.acquire(5, Priority::Normal, &cancel, None).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(flow.queued(), 1);
        cancel.cancel();
        assert!(matches!(waiting.await.unwrap(), Err(Error::Cancelled)));
        assert_eq!(flow.queued(), 0);
        drop(held);
        assert_eq!(flow.current_load(), 0);
    }

    #[actix_rt::test]
    async fn deadline_expires_queued_request() {
        let flow = Arc::new(FlowController::new(10));
        let _held = flow.try_acquire(10, Priority::Normal).unwrap();
        let deadline = Instant::now() + Duration::from_millis(20);
        let result = flow.acquire(1, Priority::High, &CancellationToken::new(), Some(deadline)).await;
        assert!(matches!(result, Err(Error::DeadlineExceeded)));
        assert_eq!(flow.queued(), 0);
        assert_eq!(flow.current_load(), 10);
    }

    #[actix_rt::test]
    async fn concurrent_acquires_respect_window() {
        let flow = Arc::new(FlowController::new(100));
        let mut handles = vec![];
        for i in 0..50usize {
            let flow = flow.clone();
            handles.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                let permit = flow.acquire(10 + i % 30, Priority::Normal, &cancel, None).await.unwrap();
                assert!(flow.current_load() <= flow.window());
                tokio::task::yield_now().await;
                drop(permit);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        flow.idle().await;
        assert_eq!(flow.current_load(), 0);
    }
}
