// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types describing service health as reported by a service directory, and
//! the metric points derived from it.

// Copyright 2024 Oxide Computer Company

pub mod metric;
pub mod service;
pub mod tags;

pub use metric::MetricPoint;
pub use service::HealthCheck;
pub use service::ServiceInstance;
pub use service::Status;
pub use tags::TagSet;
