//! BLE central daemon on BlueZ.
//!
//! Reads newline-delimited JSON commands from stdin and writes command replies
//! and session events to stdout, one JSON object per line. Commands without an
//! `id` get no reply line; their rejections are only logged.

use std::{sync::Arc, time::Duration};

use bluecentral::{
   Command, CommandReply, Config, ManagerHandle, SessionManager,
   bluetooth::bluez::BlueZDriver,
   error::Result,
   event::{CentralEvent, EventBus},
};
use crossbeam::queue::SegQueue;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::{
   io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
   select, signal,
   sync::Notify,
   time,
};

/// How long to keep flushing events after the manager has stopped
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting bluecentral daemon...");

   let config = Config::load()?;
   info!(
      "Loaded configuration (adapter: {}, thresholds {}/{} dBm)",
      config.adapter.as_deref().unwrap_or("default"),
      config.in_range_threshold_dbm,
      config.out_of_range_threshold_dbm
   );

   let driver = Arc::new(BlueZDriver::new(config.adapter.as_deref()).await?);
   let output = EventProcessor::new();
   let (manager, serving) = SessionManager::new(driver.clone(), output.clone(), config).spawn();
   let dispatcher = tokio::spawn(output.clone().run_dispatcher());

   let reader = tokio::spawn(read_commands(manager, output));
   let stop_reading = reader.abort_handle();

   select! {
      result = signal::ctrl_c() => {
         result?;
         info!("Interrupted, shutting down...");
         stop_reading.abort();
      }
      _ = reader => {
         info!("Input closed, shutting down...");
      }
   }

   // The manager shuts down once the reader has dropped its handle.
   let teardown = async {
      if let Err(e) = serving.await {
         warn!("Session manager task failed: {e}");
      }
      driver.settle().await;
   };
   if time::timeout(DRAIN_TIMEOUT, teardown).await.is_err() {
      warn!("Timed out disconnecting devices");
   }
   if time::timeout(DRAIN_TIMEOUT, dispatcher).await.is_err() {
      warn!("Timed out flushing pending events");
   }
   Ok(())
}

/// One inbound line: a command plus an optional correlation id.
#[derive(Deserialize)]
struct Envelope {
   #[serde(default)]
   id: Option<u64>,
   #[serde(flatten)]
   command: Command,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
enum Outcome {
   Ok(CommandReply),
   Error(String),
}

#[derive(Serialize)]
struct ReplyLine {
   id: Option<u64>,
   #[serde(flatten)]
   outcome: Outcome,
}

enum Output {
   Event(CentralEvent),
   Reply(ReplyLine),
}

async fn read_commands(manager: ManagerHandle, output: Arc<EventProcessor>) {
   let mut lines = BufReader::new(tokio::io::stdin()).lines();
   loop {
      let line = match lines.next_line().await {
         Ok(Some(line)) => line,
         Ok(None) => break,
         Err(e) => {
            warn!("Failed to read command: {e}");
            break;
         },
      };
      if line.trim().is_empty() {
         continue;
      }

      let Envelope { id, command } = match serde_json::from_str(&line) {
         Ok(envelope) => envelope,
         Err(e) => {
            debug!("Malformed command line: {line}");
            output.push(Output::Reply(ReplyLine {
               id: None,
               outcome: Outcome::Error(format!("Malformed command: {e}")),
            }));
            continue;
         },
      };

      let Some(id) = id else {
         if let Err(e) = manager.submit(command).await {
            warn!("Dropping command: {e}");
         }
         continue;
      };
      let outcome = match manager.request(command).await {
         Ok(reply) => Outcome::Ok(reply),
         Err(e) => Outcome::Error(e.to_string()),
      };
      output.push(Output::Reply(ReplyLine {
         id: Some(id),
         outcome,
      }));
   }
}

struct EventProcessor {
   queue: SegQueue<Output>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }

   fn push(&self, output: Output) {
      self.queue.push(output);
      self.notifier.notify_one();
   }

   async fn recv(self: &Arc<Self>) -> Option<Output> {
      loop {
         if let Some(output) = self.queue.pop() {
            return Some(output);
         }
         let notify = self.notifier.notified();
         if let Some(output) = self.queue.pop() {
            return Some(output);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn run_dispatcher(self: Arc<Self>) {
      let mut stdout = tokio::io::stdout();
      while let Some(output) = self.recv().await {
         let line = match &output {
            Output::Event(event) => serde_json::to_string(event),
            Output::Reply(reply) => serde_json::to_string(reply),
         };
         let line = match line {
            Ok(line) => line,
            Err(e) => {
               warn!("Error serializing output: {e}");
               continue;
            },
         };
         if let Err(e) = async {
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await
         }
         .await
         {
            warn!("Error writing output: {e}");
            return;
         }
      }
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, event: CentralEvent) {
      self.push(Output::Event(event));
   }
}
