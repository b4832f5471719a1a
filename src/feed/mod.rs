// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod publish;
mod render;

pub use publish::{FeedPublisher, RenderedFeed};
pub use render::{listed_episodes, render_feed};
