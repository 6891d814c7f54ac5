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
/// gridpool scatters opaque work items across a fleet of machines: a
/// central manager ships a zipped plug-in to every worker that dials
/// in and then routes work between the plug-in processes on each side.
use clap::Parser;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let args = libgridpool::Args::parse();

    if args.version() {
        println!("gridpool {}", VERSION);
        return Ok(());
    }

    libgridpool::run(args, None)
}
