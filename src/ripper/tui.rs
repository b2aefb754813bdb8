/*
 * Copyright (c) 2022 McSib
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::time::Duration;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Template of the spinner shown while a queue drains.
const DRAIN_TEMPLATE: &str = "{spinner:.cyan} [{elapsed_precise}] {prefix} {msg}";

/// Builds a [ProgressStyle], falling back to the default spinner when the
/// template does not parse.
pub(crate) fn spinner_style(template: &str) -> ProgressStyle {
    match ProgressStyle::default_spinner().template(template) {
        Ok(style) => style,
        Err(err) => {
            warn!("Template error with '{}': {}. Using default spinner.", template, err);
            ProgressStyle::default_spinner()
        }
    }
}

/// Helps in initializing and configuring a new [ProgressBar].
pub(crate) struct ProgressBarBuilder {
    progress_bar: ProgressBar,
}

impl ProgressBarBuilder {
    pub(crate) fn spinner() -> Self {
        Self {
            progress_bar: ProgressBar::new_spinner(),
        }
    }

    pub(crate) fn style(self, progress_style: ProgressStyle) -> Self {
        self.progress_bar.set_style(progress_style);
        self
    }

    pub(crate) fn draw_target(self, target: ProgressDrawTarget) -> Self {
        self.progress_bar.set_draw_target(target);
        self
    }

    pub(crate) fn prefix(self, prefix: String) -> Self {
        self.progress_bar.set_prefix(prefix);
        self
    }

    pub(crate) fn steady_tick(self, duration: Duration) -> Self {
        self.progress_bar.enable_steady_tick(duration);
        self
    }

    pub(crate) fn build(self) -> ProgressBar {
        self.progress_bar
    }
}

/// Spinner for the drain barrier of one site and media kind. Hidden when
/// `visible` is false.
pub(crate) fn drain_spinner(prefix: String, visible: bool) -> ProgressBar {
    let target = if visible {
        ProgressDrawTarget::stderr_with_hz(5)
    } else {
        ProgressDrawTarget::hidden()
    };

    ProgressBarBuilder::spinner()
        .style(spinner_style(DRAIN_TEMPLATE))
        .draw_target(target)
        .prefix(prefix)
        .steady_tick(Duration::from_millis(200))
        .build()
}
