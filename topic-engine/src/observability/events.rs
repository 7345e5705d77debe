//! Canonical structured event names used across `topic-engine`.

// Daemon runtime events.
pub const DAEMON_START: &str = "daemon_start";
pub const DAEMON_START_FAILED: &str = "daemon_start_failed";
pub const DAEMON_STOP: &str = "daemon_stop";
pub const SCHEDULER_TASK_SCHEDULED: &str = "scheduler_task_scheduled";

// Batching queue events.
pub const QUEUE_TRIGGER: &str = "queue_trigger";
pub const QUEUE_ERROR_POLICY: &str = "queue_error_policy";
pub const QUEUE_CLOSED: &str = "queue_closed";
pub const FLOW_CONTROL_CLOGGED: &str = "flow_control_clogged";
pub const FLOW_CONTROL_RELEASED: &str = "flow_control_released";

// Listener dispatch events.
pub const LISTENER_DISPATCH_FAILED: &str = "listener_dispatch_failed";

// Channel allocation events.
pub const ALLOCATION_CLEANUP: &str = "allocation_cleanup";
pub const ALLOCATION_MANUAL_IGNORED: &str = "allocation_manual_ignored";

// Publisher events.
pub const PUBLISHER_CHANNEL_CREATE: &str = "publisher_channel_create";
pub const PUBLISHER_CHANNEL_REPLACE: &str = "publisher_channel_replace";
pub const PUBLISHER_OFFER: &str = "publisher_offer";
pub const PUBLISHER_OFFER_RETRY: &str = "publisher_offer_retry";
pub const PUBLISHER_OFFER_FAILED: &str = "publisher_offer_failed";
pub const PUBLISHER_TOPIC_FULL: &str = "publisher_topic_full";
pub const PUBLISHER_CHANNEL_RESUMED: &str = "publisher_channel_resumed";
pub const PUBLISHER_CHANNEL_FAILED: &str = "publisher_channel_failed";
pub const PUBLISHER_RECONNECT_ATTEMPT: &str = "publisher_reconnect_attempt";
pub const PUBLISHER_RECONNECT_FAILED: &str = "publisher_reconnect_failed";
pub const PUBLISHER_EVENT: &str = "publisher_event";
pub const PUBLISHER_CLOSE_START: &str = "publisher_close_start";
pub const PUBLISHER_CLOSE_FLUSH_TIMEOUT: &str = "publisher_close_flush_timeout";
pub const PUBLISHER_CLOSE_OK: &str = "publisher_close_ok";
pub const PUBLISHER_ON_CLOSE_FAILED: &str = "publisher_on_close_failed";

// Subscriber events.
pub const SUBSCRIBER_STATE_CHANGE: &str = "subscriber_state_change";
pub const SUBSCRIBER_CONNECT_ATTEMPT: &str = "subscriber_connect_attempt";
pub const SUBSCRIBER_CONNECT_FAILED: &str = "subscriber_connect_failed";
pub const SUBSCRIBER_CONNECTED: &str = "subscriber_connected";
pub const SUBSCRIBER_CHANNELS_RESIZED: &str = "subscriber_channels_resized";
pub const SUBSCRIBER_DISCONNECT: &str = "subscriber_disconnect";
pub const SUBSCRIBER_RECONNECT_SCHEDULED: &str = "subscriber_reconnect_scheduled";
pub const SUBSCRIBER_RECONNECT_SKIPPED: &str = "subscriber_reconnect_skipped";
pub const SUBSCRIBER_RECONNECT_FAILED: &str = "subscriber_reconnect_failed";
pub const SUBSCRIBER_RECEIVE_FAILED: &str = "subscriber_receive_failed";
pub const SUBSCRIBER_RECEIVE_CANCELLED: &str = "subscriber_receive_cancelled";
pub const SUBSCRIBER_OWNERSHIP_CHANGED: &str = "subscriber_ownership_changed";
pub const SUBSCRIBER_CHANNEL_POPULATED: &str = "subscriber_channel_populated";
pub const SUBSCRIBER_SEEK: &str = "subscriber_seek";
pub const SUBSCRIBER_COMMIT_FAILED: &str = "subscriber_commit_failed";
pub const SUBSCRIBER_EVENT: &str = "subscriber_event";
pub const SUBSCRIBER_CLOSE_START: &str = "subscriber_close_start";
pub const SUBSCRIBER_CLOSE_FLUSH_TIMEOUT: &str = "subscriber_close_flush_timeout";
pub const SUBSCRIBER_UNSUBSCRIBE_FAILED: &str = "subscriber_unsubscribe_failed";
pub const SUBSCRIBER_CLOSE_OK: &str = "subscriber_close_ok";
pub const SUBSCRIBER_ON_CLOSE_FAILED: &str = "subscriber_on_close_failed";
