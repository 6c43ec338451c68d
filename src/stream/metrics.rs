use crate::stream::ring::RingBuffer;
use crate::stream::types::{
    LatencyBreakdown, LatencyPoint, MetricsSnapshot, ScalabilityPoint, ThroughputPoint,
    LATENCY_SERIES_CAPACITY, LOAD_TIME_SECONDS, SCALABILITY_SERIES_CAPACITY,
    THROUGHPUT_SERIES_CAPACITY,
};

/// Per-session throughput, latency and scalability series. Every series is a
/// fixed-capacity ring, so memory stays flat however long the session runs.
#[derive(Debug, Clone)]
pub struct MetricsAggregator {
    connect_ms: i64,
    current_second: Option<i64>,
    current_count: u32,
    last_throughput: u32,
    total_messages: u64,
    average_latency_s: f64,
    latency: RingBuffer<LatencyPoint>,
    throughput: RingBuffer<ThroughputPoint>,
    scalability: RingBuffer<ScalabilityPoint>,
}

impl MetricsAggregator {
    pub fn new(connect_ms: i64) -> Self {
        Self {
            connect_ms,
            current_second: None,
            current_count: 0,
            last_throughput: 0,
            total_messages: 0,
            average_latency_s: 0.0,
            latency: RingBuffer::with_capacity(LATENCY_SERIES_CAPACITY),
            throughput: RingBuffer::with_capacity(THROUGHPUT_SERIES_CAPACITY),
            scalability: RingBuffer::with_capacity(SCALABILITY_SERIES_CAPACITY),
        }
    }

    pub fn record(&mut self, seq: u64, arrival_ms: i64, transform_s: f64) -> LatencyBreakdown {
        self.count_arrival(arrival_ms);

        let extract_s = arrival_ms.saturating_sub(self.connect_ms).max(0) as f64 / 1_000.0;
        let latency = LatencyBreakdown::new(extract_s, transform_s.max(0.0), LOAD_TIME_SECONDS);

        self.total_messages = self.total_messages.saturating_add(1);
        self.average_latency_s +=
            (latency.total_s - self.average_latency_s) / self.total_messages as f64;

        self.latency.push(LatencyPoint {
            seq,
            t: arrival_ms,
            extract_s: latency.extract_s,
            transform_s: latency.transform_s,
            load_s: latency.load_s,
            total_s: latency.total_s,
        });
        self.scalability.push(ScalabilityPoint {
            t: arrival_ms,
            message_count: self.total_messages,
            avg_latency_s: self.average_latency_s,
            throughput: self.last_throughput,
        });

        latency
    }

    /// Wall-clock tick: closes the open second once the clock has moved past it,
    /// so idle seconds still show up as a zero-count point.
    pub fn tick(&mut self, now_ms: i64) {
        let now_second = now_ms.div_euclid(1_000);
        if let Some(second) = self.current_second {
            if now_second > second {
                self.commit(second);
                self.current_second = Some(now_second);
                self.current_count = 0;
            }
        }
    }

    pub fn current_throughput(&self) -> u32 {
        self.last_throughput
    }

    pub fn total_messages(&self) -> u64 {
        self.total_messages
    }

    pub fn average_latency_s(&self) -> f64 {
        self.average_latency_s
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            throughput: self.last_throughput,
            latency_series: self.latency.to_vec(),
            throughput_series: self.throughput.to_vec(),
            scalability_series: self.scalability.to_vec(),
            total_messages: self.total_messages,
            average_latency_s: self.average_latency_s,
        }
    }

    fn count_arrival(&mut self, arrival_ms: i64) {
        let arrival_second = arrival_ms.div_euclid(1_000);
        match self.current_second {
            // Late timestamps fold into the open bucket.
            Some(second) if arrival_second <= second => {
                self.current_count = self.current_count.saturating_add(1);
            }
            Some(second) => {
                self.commit(second);
                self.current_second = Some(arrival_second);
                self.current_count = 1;
            }
            None => {
                self.current_second = Some(arrival_second);
                self.current_count = 1;
            }
        }
    }

    fn commit(&mut self, second: i64) {
        self.throughput.push(ThroughputPoint {
            t: second.saturating_mul(1_000),
            count: self.current_count,
        });
        self.last_throughput = self.current_count;
    }
}
