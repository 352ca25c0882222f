// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::LazyLock;

use prometheus::{Histogram, IntCounterVec, register_histogram, register_int_counter_vec};

pub const QUEUE_LABEL: &str = "queue";
pub const OUTCOME_LABEL: &str = "outcome";

pub static MESSAGES_ENQUEUED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "burrow_messages_enqueued_total",
        "Total number of messages appended",
        &[QUEUE_LABEL]
    )
    .unwrap()
});

pub static MESSAGES_DEQUEUED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "burrow_messages_dequeued_total",
        "Total number of messages delivered to consumers",
        &[QUEUE_LABEL]
    )
    .unwrap()
});

pub static MESSAGES_ACKED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "burrow_messages_acked_total",
        "Total number of deliveries acknowledged",
        &[QUEUE_LABEL]
    )
    .unwrap()
});

pub static MESSAGES_NACKED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "burrow_messages_nacked_total",
        "Total number of deliveries returned for redelivery",
        &[QUEUE_LABEL]
    )
    .unwrap()
});

pub static RECORDS_COMPACTED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "burrow_records_compacted_total",
        "Total number of consumed records deleted by compaction",
        &[QUEUE_LABEL]
    )
    .unwrap()
});

pub static STORE_REBUILDS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "burrow_store_rebuilds_total",
        "Total number of store rebuilds by outcome",
        &[OUTCOME_LABEL]
    )
    .unwrap()
});

pub static COMPACTION_DURATION_SECONDS: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram!(
        "burrow_compaction_duration_seconds",
        "Duration of a full compaction pass in seconds"
    )
    .unwrap()
});
