// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! sackdb - an embedded, single-file, persistent ordered key/value store.
//!
//! A store is three layers, each usable on its own:
//!
//! - [`alloc`]: a power-of-two buddy allocator over a flat address space.
//! - [`sack`]: a variable-record container ([`sack::Sack`]) built on the
//!   allocator plus a [`sack::CellDirectory`] for naming a handful of
//!   top-level records (typically one B+Tree header per cell).
//! - [`btree`]: a persistent B+Tree ([`btree::BTree`]) whose nodes are sack
//!   records, addressed through a [`btree::Provider`] that owns caching and
//!   the flush protocol.
//!
//! [`metrics`] and [`lock`] are ambient collaborators, not part of the core
//! data path: the engine never reads its own metrics back, and never
//! acquires a lock itself. Both are there for a caller that wants them.
//!
//! ## Quick start
//!
//! ```rust
//! use std::io::Cursor;
//! use sackdb::btree::{BTree, BytesCodec, Provider, SackProvider};
//! use sackdb::sack::Sack;
//!
//! let sack = Sack::create(Cursor::new(Vec::new()), 20).unwrap();
//! let provider = SackProvider::<_, BytesCodec>::create(sack, 0, 64, false).unwrap();
//! let mut tree = BTree::new(provider).unwrap();
//!
//! tree.put(b"hello".to_vec(), b"world".to_vec()).unwrap();
//! assert_eq!(tree.get(b"hello").unwrap(), b"world".to_vec());
//! tree.provider_mut().flush().unwrap();
//! ```
//!
//! ## Observability
//!
//! ```rust
//! use sackdb::metrics::{Metric, MetricUnit, MetricsCollector};
//!
//! let metric = Metric::new("flush_duration", 1250.0, MetricUnit::Microseconds)
//!     .with_tag("store", "example");
//! MetricsCollector::global().record(metric);
//! ```

pub mod alloc;
pub mod btree;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod sack;

pub use btree::BTree;
pub use error::{Error, Result};
pub use metrics::{Metric, MetricUnit, MetricsCollector};
pub use sack::Sack;
