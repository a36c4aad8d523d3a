//! Retries a piece of work at linearly growing intervals.
use actix::{Actor, ActorContext, ActorFutureExt, AsyncContext, Context, Handler, Recipient, WrapFuture};
use actix_derive::Message;
use tracing::{debug, error};

use std::time::Duration;

/// Sends [Execute] to its executor until the executor answers `true`, waiting `delta`,
/// then `2 * delta`, `3 * delta` and so on between attempts. Each attempt is one epoch.
pub struct LinearBackoff {
    executor: Recipient<Execute>,
    epoch: u32,
    delta: Duration,
    /// Upper bound for the wait between two attempts.
    max_delay: Duration,
}

impl LinearBackoff {
    pub fn new(executor: Recipient<Execute>, delta: Duration, max_delay: Duration) -> Self {
        LinearBackoff { executor, epoch: 0, delta, max_delay }
    }
}

impl Actor for LinearBackoff {
    type Context = Context<Self>;

    fn stopped(&mut self, _ctx: &mut Context<Self>) {
        debug!("backoff stopped after {} epochs", self.epoch);
    }
}

/// Starts (or continues) the backoff.
#[derive(Debug, Clone, Message)]
#[rtype(result = "()")]
pub struct Start;

/// Asks the executor to try once more. Answer `true` when done.
#[derive(Debug, Clone, Message)]
#[rtype(result = "bool")]
pub struct Execute;

impl Handler<Start> for LinearBackoff {
    type Result = ();

    fn handle(&mut self, msg: Start, ctx: &mut Context<Self>) -> Self::Result {
        let attempt = self.executor.send(Execute).into_actor(self).map(move |done, act, ctx| match done {
            Ok(true) => ctx.stop(),
            Ok(false) => {
                act.epoch += 1;
                let delay = (act.delta * act.epoch).min(act.max_delay);
                debug!("backoff epoch {}, next attempt in {:?}", act.epoch, delay);
                let _ = ctx.notify_later(msg, delay);
            }
            Err(err) => {
                error!("backoff executor unavailable: {:?}", err);
                ctx.stop()
            }
        });
        // One attempt at a time.
        ctx.wait(attempt);
    }
}
