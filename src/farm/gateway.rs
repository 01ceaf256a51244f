use anyhow::Result;

use crate::types::{DepositRecord, Overview, SessionRecord, StartSessionResponse};

use super::deposits::DepositQuery;

/// Request/response boundary to the farming backend. Every operation is an independent
/// call with its own failure domain; failures come back as `Err`, never as a panic.
pub trait SessionGateway: Send + Sync {
    fn start_session(&self, wallet: &str, workers: u32) -> Result<StartSessionResponse>;

    fn get_status(&self, session_id: Option<&str>) -> Result<Vec<SessionRecord>>;

    fn get_overview(&self) -> Result<Overview>;

    fn get_deposits(
        &self,
        wallet: &str,
        since_version: Option<u64>,
        limit: u32,
    ) -> Result<Vec<DepositRecord>>;

    fn stop_session(&self, session_id: &str) -> Result<()>;

    fn clear_all_sessions(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum StopReason {
    UserRequested,
    Completed,
    /// Backend session that came back without any workers.
    Abandoned,
}

/// A gateway call tagged with the session generation it was issued under, so the reply
/// can be discarded once the state machine has moved on.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum GatewayCall {
    StartSession {
        generation: u64,
        wallet: String,
        workers: u32,
    },
    StopSession {
        generation: u64,
        session_id: String,
        reason: StopReason,
    },
    ClearAll {
        orphans: usize,
    },
    Deposits {
        generation: u64,
        wallet: String,
        query: DepositQuery,
        limit: u32,
    },
    Status {
        wallet: Option<String>,
    },
    Overview,
}

impl GatewayCall {
    pub fn label(&self) -> &'static str {
        match self {
            Self::StartSession { .. } => "start",
            Self::StopSession { .. } => "stop",
            Self::ClearAll { .. } => "clear",
            Self::Deposits { .. } => "deposits",
            Self::Status { .. } => "status",
            Self::Overview => "overview",
        }
    }
}

#[derive(Debug)]
pub enum GatewayReply {
    Started {
        generation: u64,
        requested: u32,
        result: Result<StartSessionResponse>,
    },
    Stopped {
        generation: u64,
        reason: StopReason,
        result: Result<()>,
    },
    Cleared {
        orphans: usize,
        result: Result<()>,
    },
    Deposits {
        generation: u64,
        query: DepositQuery,
        result: Result<Vec<DepositRecord>>,
    },
    Status {
        wallet: Option<String>,
        result: Result<Vec<SessionRecord>>,
    },
    Overview {
        result: Result<Overview>,
    },
}

pub fn execute(gateway: &dyn SessionGateway, call: GatewayCall) -> GatewayReply {
    match call {
        GatewayCall::StartSession {
            generation,
            wallet,
            workers,
        } => GatewayReply::Started {
            generation,
            requested: workers,
            result: gateway.start_session(&wallet, workers),
        },
        GatewayCall::StopSession {
            generation,
            session_id,
            reason,
        } => GatewayReply::Stopped {
            generation,
            reason,
            result: gateway.stop_session(&session_id),
        },
        GatewayCall::ClearAll { orphans } => GatewayReply::Cleared {
            orphans,
            result: gateway.clear_all_sessions(),
        },
        GatewayCall::Deposits {
            generation,
            wallet,
            query,
            limit,
        } => GatewayReply::Deposits {
            generation,
            query,
            result: gateway.get_deposits(&wallet, query.since_version(), query.limit(limit)),
        },
        GatewayCall::Status { wallet } => GatewayReply::Status {
            wallet,
            result: gateway.get_status(None),
        },
        GatewayCall::Overview => GatewayReply::Overview {
            result: gateway.get_overview(),
        },
    }
}
