//! Periodic status report to the ASM.
//!
//! Frame: `[be32 8 + body_len][be32 ASM_HEARTBEAT][JSON body]`. The
//! connection is opened lazily and re-opened on the next tick after any
//! failure.

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::conn::{ConnHandle, Stats};
use crate::protocol::{command, node};
use crate::timer::{TimerId, TimerOutcome, UserTimer, FOREVER};
use crate::worker::{Worker, WorkerContext};

#[derive(Debug, Serialize)]
pub struct HeartbeatBody {
    pub region_id: u32,
    pub system_id: u32,
    pub group_id: u32,
    pub conn_state: i64,
    pub conn_dealed: u64,
    pub connect_ip: String,
    pub connect_port: u16,
}

impl HeartbeatBody {
    pub fn collect(settings: &Settings, stats: &Stats) -> Self {
        Self {
            region_id: settings.region_id,
            system_id: settings.system_id,
            group_id: settings.group_id,
            conn_state: stats.connections(),
            conn_dealed: stats.accepts(),
            connect_ip: settings.connect.ip().to_string(),
            connect_port: settings.connect.port(),
        }
    }
}

pub fn encode_frame(body: &HeartbeatBody) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(body).context("serialize heartbeat")?;
    let mut frame = Vec::with_capacity(8 + json.len());
    frame.extend_from_slice(&((8 + json.len()) as u32).to_be_bytes());
    frame.extend_from_slice(&command::ASM_HEARTBEAT.to_be_bytes());
    frame.extend_from_slice(&json);
    Ok(frame)
}

fn asm_connection(ctx: &mut WorkerContext) -> Result<ConnHandle> {
    if let Some(h) = ctx.asm.filter(|h| ctx.gateway().table.is_live(*h)) {
        return Ok(h);
    }
    let asm = ctx.settings().asm;
    let h = ctx.open_outbound(asm.socket_addr(), node::ASM, asm.id)?;
    ctx.gateway().table.with(h, |c| {
        c.trans_id = 1;
        c.sequence = 1;
    });
    ctx.asm = Some(h);
    debug!(fd = h.fd, addr = %asm.socket_addr(), "ASM connection open");
    Ok(h)
}

/// Send one report, reconnecting first if needed
pub fn beat(ctx: &mut WorkerContext) -> Result<()> {
    let h = asm_connection(ctx).context("connect to ASM")?;
    let body = HeartbeatBody::collect(ctx.settings(), &ctx.gateway().stats);
    let frame = encode_frame(&body)?;
    if let Err(e) = ctx.send_raw(h, &frame) {
        ctx.close_connection(h);
        return Err(e);
    }
    Ok(())
}

/// Arm the endless heartbeat timer on the listener thread
pub fn arm(worker: &mut Worker) -> Result<TimerId> {
    let period = worker.context().settings().heartbeat_ms;
    let hold = worker.timers().ticks_for(period);
    worker.timers().create(
        FOREVER,
        hold,
        [0; 5],
        Box::new(|ctx: &mut WorkerContext, _timer: &UserTimer| {
            if let Err(e) = beat(ctx) {
                warn!("heartbeat: {:#}", e);
            }
            TimerOutcome::Continue
        }),
    )
}
