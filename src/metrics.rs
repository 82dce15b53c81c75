use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub operation: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResponseLabels {
    pub operation: String,
    pub outcome: &'static str,
}

pub struct InjectorMetrics {
    pub admission_requests_total: Family<RequestLabels, Counter>,
    pub admission_responses_total: Family<ResponseLabels, Counter>,
    pub admission_request_duration_seconds: Family<RequestLabels, Histogram>,
    pub states_created_total: Counter,
    pub audience_removals_total: Counter,
}

const DURATION_BUCKETS: [f64; 14] = [
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

fn new_duration_histogram() -> Histogram {
    Histogram::new(DURATION_BUCKETS.iter().copied())
}

impl InjectorMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let admission_requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "cmstate_admission_requests",
            "Total number of admission requests received",
            admission_requests_total.clone(),
        );

        let admission_responses_total = Family::<ResponseLabels, Counter>::default();
        registry.register(
            "cmstate_admission_responses",
            "Total number of admission responses sent, by outcome",
            admission_responses_total.clone(),
        );

        let admission_request_duration_seconds =
            Family::<RequestLabels, Histogram>::new_with_constructor(new_duration_histogram);
        registry.register(
            "cmstate_admission_request_duration_seconds",
            "Duration of admission request processing in seconds",
            admission_request_duration_seconds.clone(),
        );

        let states_created_total = Counter::default();
        registry.register(
            "cmstate_states_created",
            "Number of CMState resources created by the webhook",
            states_created_total.clone(),
        );

        let audience_removals_total = Counter::default();
        registry.register(
            "cmstate_audience_removals",
            "Number of Pods removed from a CMState audience",
            audience_removals_total.clone(),
        );

        Self {
            admission_requests_total,
            admission_responses_total,
            admission_request_duration_seconds,
            states_created_total,
            audience_removals_total,
        }
    }
}
