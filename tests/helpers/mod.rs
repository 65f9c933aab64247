//! Test peer that talks to an engine over in-memory pipes.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dapwire::protocol::{Frame, FrameReader, encode_frame};
use dapwire::{Engine, EngineHandle, EngineSettings, HandlerTable};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

const PIPE_CAPACITY: usize = 64 * 1024;
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Client side of an engine connection.
pub struct Peer {
    input: Option<DuplexStream>,
    output: DuplexStream,
    frames: FrameReader,
    backlog: VecDeque<Value>,
}

impl Peer {
    /// Write one framed JSON message.
    pub async fn send(&mut self, message: Value) {
        let body = serde_json::to_vec(&message).expect("serialize message");
        self.send_raw(&encode_frame(&body)).await;
    }

    /// Write raw bytes, e.g. a frame split across several writes.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        let input = self.input.as_mut().expect("input already closed");
        input.write_all(bytes).await.expect("write to engine");
        input.flush().await.expect("flush to engine");
    }

    /// Close the engine's input stream.
    pub fn close_input(&mut self) {
        self.input.take();
    }

    /// Next message written by the engine.
    pub async fn recv(&mut self) -> Value {
        self.try_recv()
            .await
            .expect("engine closed its output before replying")
    }

    /// Next message, or `None` once the engine closed its output.
    pub async fn try_recv(&mut self) -> Option<Value> {
        tokio::time::timeout(RECV_TIMEOUT, self.next_message())
            .await
            .expect("timed out waiting for the engine")
    }

    /// Receive `count` messages and order them by `request_seq`.
    pub async fn recv_responses(&mut self, count: usize) -> Vec<Value> {
        let mut messages = Vec::with_capacity(count);
        for _ in 0..count {
            messages.push(self.recv().await);
        }
        messages.sort_by_key(|message| message["request_seq"].as_i64());
        messages
    }

    async fn next_message(&mut self) -> Option<Value> {
        let mut chunk = [0u8; 1024];
        loop {
            if let Some(message) = self.backlog.pop_front() {
                return Some(message);
            }
            let n = self.output.read(&mut chunk).await.expect("read from engine");
            if n == 0 {
                return None;
            }
            for frame in self.frames.feed(&chunk[..n]) {
                match frame {
                    Frame::Message { body, .. } => {
                        let message = serde_json::from_slice(&body).expect("engine wrote JSON");
                        self.backlog.push_back(message);
                    }
                    Frame::Malformed { reason } => panic!("engine wrote a bad frame: {}", reason),
                }
            }
        }
    }
}

/// Start `engine` over a fresh pair of pipes.
pub fn connect(engine: Engine) -> (EngineHandle, Peer) {
    let (client_in, engine_in) = tokio::io::duplex(PIPE_CAPACITY);
    let (engine_out, client_out) = tokio::io::duplex(PIPE_CAPACITY);
    let handle = engine.start(engine_in, engine_out);
    let peer = Peer {
        input: Some(client_in),
        output: client_out,
        frames: FrameReader::new(),
        backlog: VecDeque::new(),
    };
    (handle, peer)
}

/// Engine with default settings over `table`.
pub fn start(table: HandlerTable) -> (EngineHandle, Peer) {
    connect(Engine::new(Arc::new(table)))
}

/// Engine with custom settings over `table`.
pub fn start_with(table: HandlerTable, settings: EngineSettings) -> (EngineHandle, Peer) {
    connect(Engine::new(Arc::new(table)).with_settings(settings))
}
