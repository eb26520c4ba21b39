use biometrics::{Collector, Counter, Moments};

pub(crate) static CLIENT_REQUESTS: Counter = Counter::new("chatlite.client.requests");
pub(crate) static CLIENT_REQUEST_ERRORS: Counter = Counter::new("chatlite.client.request_errors");

pub(crate) static STREAM_EVENTS: Counter = Counter::new("chatlite.stream.events");
pub(crate) static STREAM_BYTES: Counter = Counter::new("chatlite.stream.bytes");
pub(crate) static STREAM_PARSE_ERRORS: Counter = Counter::new("chatlite.stream.parse_errors");
pub(crate) static STREAM_TIMEOUTS: Counter = Counter::new("chatlite.stream.timeouts");

pub(crate) static STORE_COMMITS: Counter = Counter::new("chatlite.store.commits");
pub(crate) static STORE_CANCELLATIONS: Counter = Counter::new("chatlite.store.cancellations");
pub(crate) static STORE_INTERRUPTIONS: Counter = Counter::new("chatlite.store.interruptions");
pub(crate) static STORE_STREAM_DURATION: Moments =
    Moments::new("chatlite.store.stream_duration_seconds");

pub(crate) static PROXY_REQUESTS: Counter = Counter::new("chatlite.proxy.requests");
pub(crate) static PROXY_ERRORS: Counter = Counter::new("chatlite.proxy.errors");
pub(crate) static PROXY_UPSTREAM_TTFB: Moments = Moments::new("chatlite.proxy.upstream_ttfb_seconds");

/// Register this crate's biometrics with the provided collector.
pub fn register_biometrics(collector: Collector) {
    collector.register_counter(&CLIENT_REQUESTS);
    collector.register_counter(&CLIENT_REQUEST_ERRORS);

    collector.register_counter(&STREAM_EVENTS);
    collector.register_counter(&STREAM_BYTES);
    collector.register_counter(&STREAM_PARSE_ERRORS);
    collector.register_counter(&STREAM_TIMEOUTS);

    collector.register_counter(&STORE_COMMITS);
    collector.register_counter(&STORE_CANCELLATIONS);
    collector.register_counter(&STORE_INTERRUPTIONS);
    collector.register_moments(&STORE_STREAM_DURATION);

    collector.register_counter(&PROXY_REQUESTS);
    collector.register_counter(&PROXY_ERRORS);
    collector.register_moments(&PROXY_UPSTREAM_TTFB);
}
