//! Redirection of established requests to a new route.

use super::RoutingEngine;
use meshroute_core::{
    leg_verdict, LegPlan, LegVerdict, RedirectionTask, RequestId, Role, Upstream,
};
use std::time::{Duration, Instant};

impl RoutingEngine {
    /// Subscribe the legs of `plan` next to the current ones.
    ///
    /// A task already in flight for the request is superseded; the current
    /// legs keep delivering until cutover.
    pub(super) fn start_redirection(&mut self, id: RequestId, plan: LegPlan, now: Instant) {
        let Some(request) = self.registry.get(id) else {
            return;
        };
        let key = request.key();
        let role = request.role();
        let old_hops = request.active_hops();
        let seed = if role == Role::Receiver {
            self.cache.current_index(&key)
        } else {
            None
        };

        let superseded = self.redirections.remove(&id);
        let new_legs = self.acquire_plan(key, role, &plan);
        if let Some(previous) = superseded {
            tracing::debug!(request = %id, key = %key, "Superseding redirection");
            for leg in &previous.new_legs {
                self.release_leg(key, role, leg);
            }
        }

        tracing::debug!(
            request = %id,
            key = %key,
            old_hops = ?old_hops,
            new_hops = ?plan.iter().map(|(hop, _)| *hop).collect::<Vec<_>>(),
            seed = ?seed,
            "Redirecting"
        );
        self.redirections.insert(
            id,
            RedirectionTask::new(id, old_hops, seed, plan, new_legs, now),
        );
        self.evaluate_redirection(id);
    }

    /// Cut over once the new legs resolved and the continuity check passes.
    ///
    /// Only receiving requests carry data back to this broker; the others cut
    /// over as soon as the new legs have a verdict.
    pub(super) fn evaluate_redirection(&mut self, id: RequestId) {
        let Some(task) = self.redirections.get(&id) else {
            return;
        };
        let Some(request) = self.registry.get(id) else {
            return;
        };
        let ready = match leg_verdict(&task.new_legs) {
            LegVerdict::Pending => false,
            LegVerdict::Single(winner) => {
                let hop = task.new_legs[winner].next_hop;
                request.role() != Role::Receiver
                    || task.old_hops().contains(&hop)
                    || task.is_safe(&[hop])
            }
            LegVerdict::Negative | LegVerdict::Multiple => true,
        };
        if ready {
            self.cut_over(id);
        }
    }

    /// Replace the current legs with the task's legs.
    pub(super) fn cut_over(&mut self, id: RequestId) {
        let Some(task) = self.redirections.remove(&id) else {
            return;
        };
        self.release_legs(id);
        if let Some(request) = self.registry.get_mut(id) {
            tracing::info!(
                request = %id,
                key = %request.key(),
                old_hops = ?task.old_hops(),
                old_high_water = ?task.old_high_water(),
                "Redirection cut over"
            );
            request.plan = task.plan;
            request.upstream = Upstream::Legs(task.new_legs);
        }
        self.evaluate(id);
    }

    /// Drop a task and its unconfirmed legs; the current legs stay.
    pub(super) fn cancel_redirection(&mut self, id: RequestId) {
        let Some(task) = self.redirections.remove(&id) else {
            return;
        };
        let Some(request) = self.registry.get(id) else {
            return;
        };
        let key = request.key();
        let role = request.role();
        tracing::debug!(request = %id, key = %key, "Redirection cancelled");
        for leg in &task.new_legs {
            self.release_leg(key, role, leg);
        }
    }

    /// Apply the redirection timeout: resolved tasks are cut over without
    /// the continuity check, unresolved ones are abandoned.
    pub fn expire_redirections(&mut self, now: Instant, timeout: Duration) {
        let expired: Vec<RequestId> = self
            .redirections
            .values()
            .filter(|task| now.saturating_duration_since(task.started) >= timeout)
            .map(|task| task.request)
            .collect();
        for id in expired {
            let resolved = self
                .redirections
                .get(&id)
                .is_some_and(|task| matches!(leg_verdict(&task.new_legs), LegVerdict::Single(_)));
            if resolved {
                tracing::warn!(request = %id, "Redirection timed out, cutting over without continuity");
                self.cut_over(id);
            } else {
                tracing::warn!(request = %id, "Redirection timed out before the new route resolved");
                self.cancel_redirection(id);
            }
        }
    }

    /// When [`expire_redirections`](Self::expire_redirections) has work next.
    #[must_use]
    pub fn next_redirection_deadline(&self, timeout: Duration) -> Option<Instant> {
        self.redirections
            .values()
            .map(|task| task.started + timeout)
            .min()
    }
}
