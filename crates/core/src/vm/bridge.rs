//! Host side of the module boundary.
//!
//! The module runs on its own thread and only ever sees encoded frames. Each
//! host frame produces exactly one module reply, plus one trace frame when the
//! tick emitted anything.

use std::thread::JoinHandle;

use anyhow::{anyhow, Context, Result};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

use super::module::FlowModule;
use super::protocol::{decode_trace_frame, encode_trace_frame, HostMessage, ModuleMessage, PropertyValue};
use super::trace::{TraceBuffer, TraceEvent};

pub struct VmBridge {
    to_module: Option<UnboundedSender<Vec<u8>>>,
    from_module: UnboundedReceiver<Vec<u8>>,
    traces: UnboundedReceiver<Vec<u8>>,
    worker: Option<JoinHandle<()>>,
}

impl VmBridge {
    pub fn spawn<M>(module: M) -> Result<Self>
    where
        M: FlowModule + 'static,
    {
        let (to_module, inbox) = unbounded_channel();
        let (outbox, from_module) = unbounded_channel();
        let (trace_tx, traces) = unbounded_channel();

        let worker = std::thread::Builder::new()
            .name("seqflow-vm".to_string())
            .spawn(move || run_worker(module, inbox, outbox, trace_tx))
            .context("failed to spawn VM worker thread")?;

        Ok(Self {
            to_module: Some(to_module),
            from_module,
            traces,
            worker: Some(worker),
        })
    }

    pub fn send(&self, message: &HostMessage) -> Result<()> {
        self.send_raw(message.encode()?)
    }

    /// Sends pre-encoded bytes as-is.
    pub fn send_raw(&self, frame: Vec<u8>) -> Result<()> {
        self.to_module
            .as_ref()
            .ok_or_else(|| anyhow!("VM bridge is shut down"))?
            .send(frame)
            .map_err(|_| anyhow!("VM worker has exited"))
    }

    /// Replies received so far. Undecodable replies are dropped.
    pub fn poll_messages(&mut self) -> Vec<ModuleMessage> {
        let mut messages = Vec::new();
        while let Ok(frame) = self.from_module.try_recv() {
            match ModuleMessage::decode(&frame) {
                Ok(message) => messages.push(message),
                Err(error) => warn!("dropping malformed module frame: {error:#}"),
            }
        }
        messages
    }

    pub fn poll_traces(&mut self) -> Vec<TraceEvent> {
        let mut events = Vec::new();
        while let Ok(frame) = self.traces.try_recv() {
            match decode_trace_frame(&frame) {
                Ok(batch) => events.extend(batch),
                Err(error) => warn!("dropping malformed trace frame: {error:#}"),
            }
        }
        events
    }

    /// Blocks until the next reply. Must not be called from an async task.
    pub fn wait_message(&mut self) -> Result<ModuleMessage> {
        let frame = self
            .from_module
            .blocking_recv()
            .ok_or_else(|| anyhow!("VM worker has exited"))?;
        ModuleMessage::decode(&frame)
    }

    pub fn shutdown(&mut self) {
        self.to_module.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("VM worker thread panicked");
            }
        }
    }
}

impl Drop for VmBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker<M: FlowModule>(
    mut module: M,
    mut inbox: UnboundedReceiver<Vec<u8>>,
    outbox: UnboundedSender<Vec<u8>>,
    traces: UnboundedSender<Vec<u8>>,
) {
    info!("VM worker started");
    let mut trace = TraceBuffer::new();

    while let Some(frame) = inbox.blocking_recv() {
        let message = match HostMessage::decode(&frame) {
            Ok(message) => message,
            Err(error) => {
                warn!(fault = "protocol", "dropping malformed host frame: {error:#}");
                continue;
            }
        };

        let reply = handle_message(&mut module, message, &mut trace);
        match reply.encode() {
            Ok(bytes) => {
                if outbox.send(bytes).is_err() {
                    break;
                }
            }
            Err(error) => error!("failed to encode module reply: {error:#}"),
        }

        if let Some(batch) = trace.take_flush() {
            match encode_trace_frame(&batch) {
                Ok(bytes) => {
                    if traces.send(bytes).is_err() {
                        debug!("trace receiver gone");
                    }
                }
                Err(error) => error!("failed to encode trace frame: {error:#}"),
            }
        }
    }
    info!("VM worker stopped");
}

fn handle_message<M: FlowModule>(
    module: &mut M,
    message: HostMessage,
    trace: &mut TraceBuffer,
) -> ModuleMessage {
    if let Some(blob) = &message.graph {
        if let Err(error) = module.load(blob) {
            error!("graph load failed: {error:#}");
        }
    }
    if let Some(wheel) = message.wheel {
        module.on_wheel_event(wheel);
    }
    for event in message.pointer_events {
        module.on_pointer_event(event);
    }
    for update in message.global_updates {
        if let Err(error) = module.update_global(update.index, update.value) {
            warn!("global update rejected: {error:#}");
        }
    }
    if let Some(command) = &message.debugger_command {
        if let Err(error) = module.on_debugger_message(command) {
            warn!("debugger command rejected: {error:#}");
        }
    }
    for action in message.widget_actions {
        if let Err(error) = module.execute_widget_action(action) {
            warn!("widget action rejected: {error:#}");
        }
    }

    if let Err(error) = module.main_loop(trace) {
        error!("module tick failed: {error:#}");
    }

    let property_values = message
        .eval_properties
        .iter()
        .map(|request| PropertyValue {
            request_id: request.request_id,
            result: module
                .eval_property(request)
                .map_err(|error| format!("{error:#}")),
        })
        .collect();

    ModuleMessage {
        frame: module.synced_frame(),
        property_values,
    }
}
