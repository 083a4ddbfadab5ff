//! 编排层：Turn Engine 主循环、Planner 检查点、Hosted run 轮询、过程事件

pub mod events;
pub mod loop_;
pub mod planner;
pub mod run_poller;

pub use events::{AgentEvent, NotificationSink, Notifier};
pub use loop_::{TurnEngine, MAX_TURNS};
pub use planner::{
    digest, planner_registry, CheckinOutcome, PlannerController, PlannerPhase, PlannerPrompts,
};
pub use run_poller::RunStatusPoller;
