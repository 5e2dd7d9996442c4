//-
// Copyright (c) 2020, 2024, Jason Lingle
//
// This file is part of Postern.
//
// Postern is free software: you can  redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Postern is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Postern. If not, see <http://www.gnu.org/licenses/>.

//! Background delivery of new messages.
//!
//! Deliveries run on a dedicated worker thread fed by a bounded queue, so
//! that their events reach selected mailboxes on a thread other than any
//! session's. A full queue blocks the submitter.

use std::sync::Arc;
use std::thread;

use chrono::prelude::*;
use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, error, info, warn};

use super::account::Account;
use super::model::*;
use crate::support::error::Error;

#[derive(Clone, Debug)]
pub struct DeliveryRequest {
    pub mailbox: String,
    pub flags: Vec<Flag>,
    pub internal_date: DateTime<FixedOffset>,
    pub size: u32,
}

struct Job {
    request: DeliveryRequest,
    ack: Option<Sender<Result<Uid, Error>>>,
}

pub struct DeliveryAgent {
    log_prefix: String,
    sender: Option<Sender<Job>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl DeliveryAgent {
    /// Start the worker thread delivering into `account`.
    pub fn start(
        log_prefix: String,
        account: Arc<Account>,
        queue_depth: usize,
    ) -> Self {
        let (sender, receiver) = channel::bounded(queue_depth.max(1));
        let worker_prefix = log_prefix.clone();
        let worker =
            thread::spawn(move || run_worker(worker_prefix, account, receiver));

        DeliveryAgent {
            log_prefix,
            sender: Some(sender),
            worker: Some(worker),
        }
    }

    /// Queue `request` for delivery without waiting for it.
    ///
    /// Failures of the delivery itself are only logged.
    pub fn deliver(&self, request: DeliveryRequest) -> Result<(), Error> {
        self.submit(Job { request, ack: None })
    }

    /// Queue `request` and wait for it to be delivered, returning the new
    /// message's UID.
    pub fn deliver_and_wait(
        &self,
        request: DeliveryRequest,
    ) -> Result<Uid, Error> {
        let (ack, result) = channel::bounded(1);
        self.submit(Job {
            request,
            ack: Some(ack),
        })?;
        result.recv().map_err(|_| Error::DeliveryStopped)?
    }

    fn submit(&self, job: Job) -> Result<(), Error> {
        self.sender
            .as_ref()
            .ok_or(Error::DeliveryStopped)?
            .send(job)
            .map_err(|_| Error::DeliveryStopped)
    }

    /// Stop accepting requests and wait for the queued ones to finish.
    pub fn shutdown(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("{} Delivery worker panicked", self.log_prefix);
            }
        }
    }
}

impl Drop for DeliveryAgent {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(
    log_prefix: String,
    account: Arc<Account>,
    receiver: Receiver<Job>,
) {
    for job in receiver {
        let result = deliver_one(&account, &job.request);
        match result {
            Ok(uid) => info!(
                "{} Delivered {:?} to {}",
                log_prefix, uid, job.request.mailbox
            ),
            Err(ref e) => warn!(
                "{} Delivery to {} failed: {}",
                log_prefix, job.request.mailbox, e
            ),
        }

        if let Some(ack) = job.ack {
            // The submitter may have given up waiting
            let _ = ack.send(result);
        }
    }

    debug!("{} Delivery worker exiting", log_prefix);
}

fn deliver_one(
    account: &Account,
    request: &DeliveryRequest,
) -> Result<Uid, Error> {
    account.mailbox(&request.mailbox)?.append(
        request.flags.clone(),
        request.internal_date,
        request.size,
        None,
    )
}
