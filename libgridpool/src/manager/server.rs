// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::net::TcpListener;

use anyhow::Context;
use tracing::{error, info, instrument};

use crate::manager::router::Event;

/// Bind the manager's listening socket. A bind failure is fatal for
/// the server; the caller surfaces it and waits for the operator.
pub fn bind(port: u16) -> anyhow::Result<TcpListener> {
    let listener =
        TcpListener::bind(("0.0.0.0", port)).with_context(|| format!("binding port {}", port))?;
    info!("listening on port {}", port);
    Ok(listener)
}

/// Accept connections forever, handing each accepted socket to the
/// router, which owns session construction and the live set. Exits
/// when the router side of the queue goes away.
#[instrument(skip_all)]
pub fn serve(listener: TcpListener, events: crossbeam_channel::Sender<Event>) {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                info!("socket got a new connection");
                if events.send(Event::Accepted(stream)).is_err() {
                    break;
                }
            }
            Err(err) => {
                error!("accepting stream: {:?}", err);
            }
        }
    }
}
