// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::{Mutex, Notify};

use crate::{ChannelMsg, Error};

#[derive(Debug, Default)]
struct WindowState {
    size: u32,
    closed: bool,
}

/// The remote window of a channel, shared between the session task
/// (which grows it on CHANNEL_WINDOW_ADJUST) and the [`super::Channel`]
/// (which spends it on data).
#[derive(Debug, Clone, Default)]
pub(crate) struct WindowSizeRef {
    state: Arc<Mutex<WindowState>>,
    notify: Arc<Notify>,
}

impl WindowSizeRef {
    pub(crate) fn new(size: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(WindowState {
                size,
                closed: false,
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Add `by` bytes to the window, returning the new size.
    pub(crate) async fn grow(&self, by: u32) -> u32 {
        let mut state = self.state.lock().await;
        state.size = state.size.saturating_add(by);
        let size = state.size;
        drop(state);
        self.notify.notify_waiters();
        size
    }

    /// Take up to `max` bytes from the window, waiting while it is
    /// empty. Fails once the channel is closed.
    pub(crate) async fn reserve(&self, max: u32) -> Result<u32, Error> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().await;
                if state.closed {
                    return Err(Error::WrongChannel);
                }
                if state.size > 0 && max > 0 {
                    let n = state.size.min(max);
                    state.size -= n;
                    return Ok(n);
                }
            }
            notified.await;
        }
    }

    /// Wake every waiter with an error.
    pub(crate) async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    pub(crate) async fn size(&self) -> u32 {
        self.state.lock().await.size
    }
}

/// The session's end of a [`super::Channel`].
#[derive(Debug)]
pub(crate) struct ChannelRef {
    pub(crate) sender: UnboundedSender<ChannelMsg>,
    pub(crate) window_size: WindowSizeRef,
}

impl ChannelRef {
    pub fn new(sender: UnboundedSender<ChannelMsg>, window_size: WindowSizeRef) -> Self {
        Self {
            sender,
            window_size,
        }
    }

    pub(crate) fn window_size(&self) -> &WindowSizeRef {
        &self.window_size
    }
}

impl std::ops::Deref for ChannelRef {
    type Target = UnboundedSender<ChannelMsg>;

    fn deref(&self) -> &Self::Target {
        &self.sender
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn reserve_waits_for_window() {
        let window = WindowSizeRef::new(10);
        assert_eq!(window.reserve(4).await.unwrap(), 4);
        assert_eq!(window.reserve(100).await.unwrap(), 6);

        let waiter = {
            let window = window.clone();
            tokio::spawn(async move { window.reserve(100).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        assert_eq!(window.grow(7).await, 7);
        assert_eq!(waiter.await.unwrap().unwrap(), 7);
        assert_eq!(window.size().await, 0);
    }

    #[tokio::test]
    async fn closing_wakes_waiters() {
        let window = WindowSizeRef::new(0);
        let waiter = {
            let window = window.clone();
            tokio::spawn(async move { window.reserve(1).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        window.close().await;
        assert!(matches!(waiter.await.unwrap(), Err(Error::WrongChannel)));
        assert!(window.reserve(1).await.is_err());
    }
}
