//! Metrics tie-ins

use std::net::UdpSocket;

use cadence::{
    BufferedUdpMetricSink, NopMetricSink, QueuingMetricSink, StatsdClient, StatsdClientBuilder,
};

use crate::errors::Result;

/// Create a cadence StatsdClient builder from the given options
pub fn builder(prefix: &str, host: &Option<String>, port: u16) -> Result<StatsdClientBuilder> {
    let builder = if let Some(statsd_host) = host.as_ref() {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_nonblocking(true)?;

        let host = (statsd_host.as_str(), port);
        let udp_sink = BufferedUdpMetricSink::from(host, socket)?;
        let sink = QueuingMetricSink::from(udp_sink);
        StatsdClient::builder(prefix, sink)
    } else {
        StatsdClient::builder(prefix, NopMetricSink)
    };
    Ok(builder.with_error_handler(|err| error!("Metrics send error: {}", err)))
}

/// A no-op client for tests
pub fn new_test_metrics() -> StatsdClient {
    StatsdClient::builder("outdial-test", NopMetricSink).build()
}
