// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod ingest;
mod retry;

pub use ingest::{Ingestor, Outcome};
pub use retry::{RetryPolicy, deadline};
