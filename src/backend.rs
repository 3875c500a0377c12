/*
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

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

/// An upstream endpoint selected by a [`crate::Scheduler`] to receive
/// proxied bytes.
///
/// `Backend` is opaque from the relay core's point of view: it only needs
/// an `address()` to dial and equality/hash semantics suitable for use as
/// a counter key. Schedulers are free to carry extra routing metadata in
/// their own backend registries keyed by the same address.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Backend {
    addr: SocketAddr,
    name: Arc<str>,
}

impl Backend {
    pub fn new(addr: SocketAddr) -> Self {
        Backend {
            addr,
            name: Arc::from(addr.to_string()),
        }
    }

    pub fn named(addr: SocketAddr, name: impl Into<Arc<str>>) -> Self {
        Backend {
            addr,
            name: name.into(),
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.addr
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.as_ref() == self.addr.to_string() {
            write!(f, "{}", self.addr)
        } else {
            write!(f, "{}({})", self.name, self.addr)
        }
    }
}

impl From<SocketAddr> for Backend {
    fn from(addr: SocketAddr) -> Self {
        Backend::new(addr)
    }
}
