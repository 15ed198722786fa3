//! Command dispatch: decide per message whether to serve it here, relay it
//! along a proxy pair or reject it, then run the local operation.
//!
//! Every handler returns `Err` for anything that should end the connection;
//! the reactor closes it (and its proxy partner) and logs the reason.

use anyhow::{bail, Context, Result};
use std::net::SocketAddrV4;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

use crate::conn::{ConnHandle, UploadState};
use crate::migration::{MigrationConfig, MigrationState};
use crate::pathops;
use crate::protocol::{ack, command, command_name, is_response, node, HEADER_LEN, MAX_MSG_DATA_LEN};
use crate::protocol::{VERSION_MAJOR, VERSION_MINOR};
use crate::protocol_core::{Message, MigrationOptions, MsgHeader, TaskInfo};
use crate::replica;
use crate::worker::WorkerContext;

/// Response fields beyond the addressing copied from the request
#[derive(Clone, Copy, Debug, Default)]
struct Reply {
    ack_code: u32,
    total: u64,
    offset: u64,
    count: u32,
}

impl Reply {
    fn ok() -> Self {
        Self {
            ack_code: ack::OK,
            ..Self::default()
        }
    }

    fn failed() -> Self {
        Self {
            ack_code: ack::FAILED,
            ..Self::default()
        }
    }
}

/// Entry point for every complete message
pub fn deal_message(ctx: &mut WorkerContext, h: ConnHandle, msg: Message) -> Result<()> {
    let hdr = msg.header;
    let cmd = hdr.command;
    debug!(
        fd = h.fd,
        cmd = command_name(cmd),
        len = hdr.length,
        src_type = hdr.src_type,
        src_id = hdr.src_id,
        "message"
    );

    if hdr.src_type != node::CLIENT && hdr.src_type != node::GATEWAY {
        bail!("{} from unexpected node type {}", command_name(cmd), hdr.src_type);
    }
    ctx.gateway()
        .table
        .with(h, |c| {
            c.peer_type = hdr.src_type;
            c.peer_id = hdr.src_id;
            c.trans_id = hdr.trans_id;
            c.sequence = hdr.sequence;
        })
        .with_context(|| format!("fd {} is gone", h.fd))?;

    // An answer travelling back along a proxy pair belongs to a request
    // that was already admitted
    let in_flight = is_response(cmd) && ctx.proxies.is_proxied(h);
    let gate = &ctx.gateway().migration;
    if !in_flight && !gate.allows(cmd) {
        let state = gate.state();
        warn!(
            fd = h.fd,
            cmd = command_name(cmd),
            state = state.as_str(),
            "command rejected during migration"
        );
        if is_response(cmd) {
            bail!("{} refused while {}", command_name(cmd), state.as_str());
        }
        respond_and_close(ctx, h, &hdr, Reply::failed());
        return Ok(());
    }

    match cmd {
        command::START_UPLOAD_REQ | command::START_DOWNLOAD_REQ | command::DELETE_REQ => {
            handle_task_request(ctx, h, msg)
        }
        command::UPLOAD_DATA_REQ | command::UPLOAD_FINISH_REQ | command::DOWNLOAD_DATA_REQ => {
            handle_transfer(ctx, h, msg)
        }
        command::DOWNLOAD_FINISH_REQ => match ctx.proxies.partner(h) {
            Some(partner) => forward_message(ctx, partner, msg),
            None => download_finish(ctx, h, &hdr),
        },
        command::GET_FILE_LIST_REQ => match ctx.proxies.partner(h) {
            Some(partner) => forward_message(ctx, partner, msg),
            None => file_list(ctx, h, &msg),
        },
        command::SEQ_DOWNLOAD_REQ => seq_download(ctx, h, &msg),
        command::HEARTBEAT_REQ => send_response(ctx, h, &hdr, Reply::ok(), Vec::new()),

        command::START_UPLOAD_RSP
        | command::UPLOAD_DATA_RSP
        | command::START_DOWNLOAD_RSP
        | command::DOWNLOAD_DATA_RSP
        | command::GET_FILE_LIST_RSP
        | command::SEQ_DOWNLOAD_RSP => relay_response(ctx, h, msg, false),
        command::UPLOAD_FINISH_RSP | command::DOWNLOAD_FINISH_RSP | command::DELETE_RSP => {
            relay_response(ctx, h, msg, true)
        }

        command::MIGRATION_START_REQ => migration_start(ctx, h, &msg),
        command::MIGRATION_FINISHED_REQ => migration_finished(ctx, h, &hdr),
        command::MIGRATION_STOP_REQ | command::MIGRATION_CANCEL_REQ => {
            info!(fd = h.fd, cmd = command_name(cmd), "accepted, nothing to do");
            Ok(())
        }
        other => bail!("unsupported command {:#010x} ({})", other, command_name(other)),
    }
}

/// Build and queue `request.command + 1` back to the requester
fn send_response(ctx: &mut WorkerContext, h: ConnHandle, req: &MsgHeader, reply: Reply, payload: Vec<u8>) -> Result<()> {
    let header = MsgHeader {
        length: 0,
        major: VERSION_MAJOR,
        minor: VERSION_MINOR,
        src_type: node::GATEWAY,
        dst_type: req.src_type,
        src_id: ctx.settings().local.id,
        dst_id: req.src_id,
        trans_id: req.trans_id,
        sequence: req.sequence,
        command: req.command + 1,
        ack_code: reply.ack_code,
        total: reply.total,
        offset: reply.offset,
        count: reply.count,
    };
    ctx.send_message(h, &Message::new(header, payload))
}

/// Queue a final response, push it out as far as the socket allows, then
/// close the connection
fn respond_and_close(ctx: &mut WorkerContext, h: ConnHandle, req: &MsgHeader, reply: Reply) {
    if send_response(ctx, h, req, reply, Vec::new()).is_ok() {
        let _ = ctx.flush_send(h);
    }
    ctx.close_connection(h);
}

/// Relay a message to `to`, rewriting only the addressing. A relay failure
/// tears the pair down.
fn forward_message(ctx: &mut WorkerContext, to: ConnHandle, mut msg: Message) -> Result<()> {
    let (dst_type, dst_id) = ctx
        .gateway()
        .table
        .with(to, |c| (c.peer_type, c.peer_id))
        .with_context(|| format!("proxy partner fd {} is gone", to.fd))?;
    msg.header.src_type = node::GATEWAY;
    msg.header.src_id = ctx.settings().local.id;
    msg.header.dst_type = dst_type;
    msg.header.dst_id = dst_id;
    if let Err(e) = ctx.send_message(to, &msg) {
        ctx.close_connection(to);
        return Err(e.context(format!("relay {} to fd {}", command_name(msg.header.command), to.fd)));
    }
    Ok(())
}

fn relay_response(ctx: &mut WorkerContext, h: ConnHandle, msg: Message, terminal: bool) -> Result<()> {
    let Some(partner) = ctx.proxies.partner(h) else {
        bail!("{} arrived on fd {} without a proxy partner", command_name(msg.header.command), h.fd);
    };
    forward_message(ctx, partner, msg)?;
    if terminal {
        // The partner keeps its queued response and serves further requests
        ctx.proxies.unlink(h);
        debug!(fd = h.fd, partner = partner.fd, "proxy hop finished");
        ctx.close_connection(h);
    }
    Ok(())
}

/// Open the next hop for `task`, link it with `h` and return it
fn connect_to_next_gateway(ctx: &mut WorkerContext, h: ConnHandle, hdr: &MsgHeader, task: &TaskInfo) -> Result<ConnHandle> {
    let peer = SocketAddrV4::new(task.sgw_ip, task.sgw_port);
    let next = ctx
        .open_outbound(peer, node::GATEWAY, task.sgw_id)
        .with_context(|| format!("connect to next gateway {} (id {:#x})", peer, task.sgw_id))?;
    ctx.gateway().table.with(next, |c| {
        c.trans_id = hdr.trans_id;
        c.sequence = hdr.sequence;
    });
    if let Err(e) = ctx.proxies.link(h, next) {
        ctx.close_connection(next);
        return Err(e);
    }
    info!(fd = h.fd, next = next.fd, %peer, "proxying to next gateway");
    Ok(next)
}

/// Requests carrying a task descriptor: served here when the target gateway
/// is this node, relayed otherwise
fn handle_task_request(ctx: &mut WorkerContext, h: ConnHandle, msg: Message) -> Result<()> {
    if let Some(partner) = ctx.proxies.partner(h) {
        return forward_message(ctx, partner, msg);
    }
    let task = TaskInfo::decode(&msg.payload)?;
    if !ctx.settings().is_listening_ip(task.sgw_ip) {
        let next = connect_to_next_gateway(ctx, h, &msg.header, &task)?;
        return forward_message(ctx, next, msg);
    }
    let hdr = msg.header;
    match hdr.command {
        command::START_UPLOAD_REQ => start_upload(ctx, h, &hdr, &task),
        command::START_DOWNLOAD_REQ => start_download(ctx, h, &hdr, &task),
        command::DELETE_REQ => delete(ctx, h, &hdr, &task),
        other => bail!("{} is not a task request", command_name(other)),
    }
}

/// Data-phase requests: relayed on a proxied connection, else served here
fn handle_transfer(ctx: &mut WorkerContext, h: ConnHandle, msg: Message) -> Result<()> {
    if let Some(partner) = ctx.proxies.partner(h) {
        return forward_message(ctx, partner, msg);
    }
    if msg.header.src_id == 0 {
        bail!("{} from an unidentified peer", command_name(msg.header.command));
    }
    match msg.header.command {
        command::UPLOAD_DATA_REQ => upload_data(ctx, h, &msg),
        command::UPLOAD_FINISH_REQ => upload_finish(ctx, h, &msg.header),
        command::DOWNLOAD_DATA_REQ => download_data(ctx, h, &msg.header),
        other => bail!("{} is not a transfer request", command_name(other)),
    }
}

fn upload_state(ctx: &WorkerContext, h: ConnHandle) -> Result<UploadState> {
    ctx.gateway()
        .table
        .with(h, |c| c.upload)
        .with_context(|| format!("fd {} is gone", h.fd))
}

fn start_upload(ctx: &mut WorkerContext, h: ConnHandle, hdr: &MsgHeader, task: &TaskInfo) -> Result<()> {
    let state = upload_state(ctx, h)?;
    if state != UploadState::Idle {
        bail!("START_UPLOAD while an upload is in progress ({:?})", state);
    }
    if !task.has_valid_md5() {
        bail!("upload of {} declares checksum {:?}", task.file_name, task.file_md5);
    }
    let files = replica::open_for_upload(
        &ctx.settings().backends,
        &task.file_name,
        task.file_len,
        &task.file_md5,
    )?;
    let replicas = files.len();
    ctx.gateway().table.with(h, |c| {
        c.close_backends();
        c.backends = files;
        c.upload = if task.file_len == 0 {
            UploadState::AwaitingFinish
        } else {
            UploadState::Receiving {
                remaining: task.file_len,
            }
        };
    });
    info!(fd = h.fd, file = %task.file_name, size = task.file_len, replicas, "upload started");
    let reply = Reply {
        total: task.file_len,
        ..Reply::ok()
    };
    send_response(ctx, h, hdr, reply, Vec::new())
}

fn upload_data(ctx: &mut WorkerContext, h: ConnHandle, msg: &Message) -> Result<()> {
    let hdr = &msg.header;
    let count = hdr.count as usize;
    if hdr.length as usize != count + HEADER_LEN || count == 0 || count > MAX_MSG_DATA_LEN {
        bail!(
            "malformed UPLOAD_DATA: length {} count {}",
            hdr.length,
            hdr.count
        );
    }
    let remaining = match upload_state(ctx, h)? {
        UploadState::Receiving { remaining } => remaining,
        other => bail!("UPLOAD_DATA in upload state {:?}", other),
    };
    ctx.gateway()
        .table
        .with(h, |c| -> Result<()> {
            replica::write_chunk(&mut c.backends, hdr.offset, &msg.payload)?;
            let left = remaining.saturating_sub(count as u64);
            c.upload = if left == 0 {
                UploadState::AwaitingFinish
            } else {
                UploadState::Receiving { remaining: left }
            };
            Ok(())
        })
        .with_context(|| format!("fd {} is gone", h.fd))??;
    let reply = Reply {
        total: hdr.total,
        offset: hdr.offset,
        count: hdr.count,
        ..Reply::ok()
    };
    send_response(ctx, h, hdr, reply, Vec::new())
}

fn upload_finish(ctx: &mut WorkerContext, h: ConnHandle, hdr: &MsgHeader) -> Result<()> {
    if hdr.length as usize != HEADER_LEN {
        bail!("UPLOAD_FINISH carries {} bytes", hdr.length);
    }
    let state = upload_state(ctx, h)?;
    if state != UploadState::AwaitingFinish {
        bail!("UPLOAD_FINISH in upload state {:?}", state);
    }
    let finished = ctx
        .gateway()
        .table
        .with(h, |c| {
            c.upload = UploadState::Idle;
            replica::finish_upload(&mut c.backends)
        })
        .with_context(|| format!("fd {} is gone", h.fd))?;
    match finished {
        Ok(()) => {
            info!(fd = h.fd, "upload verified");
            send_response(ctx, h, hdr, Reply::ok(), Vec::new())
        }
        Err(e) => {
            error!(fd = h.fd, "upload verification failed: {:#}", e);
            respond_and_close(ctx, h, hdr, Reply::failed());
            Ok(())
        }
    }
}

fn start_download(ctx: &mut WorkerContext, h: ConnHandle, hdr: &MsgHeader, task: &TaskInfo) -> Result<()> {
    let (files, size) = replica::open_for_download(&ctx.settings().backends, &task.file_name)?;
    ctx.gateway().table.with(h, |c| {
        c.close_backends();
        c.backends = files;
    });
    debug!(fd = h.fd, file = %task.file_name, size, "download started");
    let reply = Reply {
        total: size,
        ..Reply::ok()
    };
    send_response(ctx, h, hdr, reply, Vec::new())
}

fn download_data(ctx: &mut WorkerContext, h: ConnHandle, hdr: &MsgHeader) -> Result<()> {
    let data = ctx
        .gateway()
        .table
        .with(h, |c| {
            if c.backends.is_empty() {
                bail!("DOWNLOAD_DATA before START_DOWNLOAD");
            }
            replica::read_chunk(&c.backends, hdr.offset, hdr.count as usize)
        })
        .with_context(|| format!("fd {} is gone", h.fd))??;
    let reply = Reply {
        total: hdr.total,
        offset: hdr.offset,
        count: data.len() as u32,
        ..Reply::ok()
    };
    send_response(ctx, h, hdr, reply, data)
}

fn download_finish(ctx: &mut WorkerContext, h: ConnHandle, hdr: &MsgHeader) -> Result<()> {
    ctx.gateway().table.with(h, |c| c.close_backends());
    send_response(ctx, h, hdr, Reply::ok(), Vec::new())
}

fn delete(ctx: &mut WorkerContext, h: ConnHandle, hdr: &MsgHeader, task: &TaskInfo) -> Result<()> {
    let reply = if replica::delete_replicas(&ctx.settings().backends, &task.file_name)? {
        info!(fd = h.fd, file = %task.file_name, "deleted");
        Reply::ok()
    } else {
        warn!(fd = h.fd, file = %task.file_name, "delete left replicas behind");
        Reply::failed()
    };
    send_response(ctx, h, hdr, reply, Vec::new())
}

/// Listing of the sharded directory for `study/serial`, sent raw
fn file_list(ctx: &mut WorkerContext, h: ConnHandle, msg: &Message) -> Result<()> {
    let task = TaskInfo::decode(&msg.payload)?;
    let (study, serial) = pathops::split_key(&task.file_name);
    let found = ctx.settings().backends.iter().find_map(|root| {
        let dir = pathops::shard_path(root, study, serial);
        dir.is_dir().then(|| (root.clone(), dir))
    });
    let list = match found {
        Some((root, dir)) => pathops::build_file_list(&root, &[dir])?,
        None => {
            debug!(fd = h.fd, key = %task.file_name, "no backend holds this key");
            pathops::build_file_list(&PathBuf::new(), &[])?
        }
    };
    ctx.send_raw(h, &list)
        .with_context(|| format!("file list of {} bytes", list.len()))
}

/// Switch the connection to whole-file streaming from the first backend
fn seq_download(ctx: &mut WorkerContext, h: ConnHandle, msg: &Message) -> Result<()> {
    let task = TaskInfo::decode(&msg.payload)?;
    let root = ctx
        .settings()
        .backends
        .first()
        .context("no backend configured")?
        .clone();
    let file = replica::open_sequential(&root, &task.file_name)?;
    let size = file.size;
    ctx.gateway().table.with(h, |c| {
        c.close_backends();
        c.backends = vec![file];
        c.sequential = true;
    });
    ctx.poller.stop_recv(h.fd)?;
    ctx.poller.start_send(h.fd)?;
    info!(fd = h.fd, file = %task.file_name, size, "sequential download started");
    Ok(())
}

fn migration_start(ctx: &mut WorkerContext, h: ConnHandle, msg: &Message) -> Result<()> {
    let options = MigrationOptions::decode(&msg.payload)?;
    let gateway = ctx.gateway().clone();
    match gateway.migration.begin() {
        Ok(()) => {}
        Err(MigrationState::Migrated) => {
            info!(fd = h.fd, "already migrated, refusing client");
            ctx.close_connection(h);
            return Ok(());
        }
        Err(state) => {
            warn!(fd = h.fd, state = state.as_str(), "MIGRATION_START refused");
            return send_response(ctx, h, &msg.header, Reply::failed(), Vec::new());
        }
    }
    let backend_dir = gateway
        .settings
        .backends
        .first()
        .context("no backend configured")?
        .clone();
    let config = MigrationConfig {
        options,
        backend_dir,
    };
    let handle = gateway.launcher.launch(&config)?;
    info!(fd = h.fd, pid = ?handle.pid, config = %handle.config_path.display(), "migration started");
    send_response(ctx, h, &msg.header, Reply::ok(), Vec::new())
}

fn migration_finished(ctx: &mut WorkerContext, h: ConnHandle, hdr: &MsgHeader) -> Result<()> {
    if hdr.ack_code != ack::OK {
        bail!("migration finished with ack {}", hdr.ack_code);
    }
    let gateway = ctx.gateway().clone();
    if let Err(state) = gateway.migration.complete() {
        bail!("MIGRATION_FINISHED while {}", state.as_str());
    }
    info!(fd = h.fd, "migration complete");
    send_response(ctx, h, hdr, Reply::ok(), Vec::new())?;
    let _ = ctx.flush_send(h);
    gateway.launcher.on_completion(hdr.ack_code);
    Ok(())
}
