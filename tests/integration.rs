// Integration test suite for the workflow broker.
//
// `health`/`ingress` drive HTTP-facing routes through Rocket's local test
// client. `socket` goes further and boots a real listener, since Rocket's
// local client never performs the upgrade a WebSocket route needs — it's the
// only place event delivery (`ws.rs`'s `applies_to`) is exercised over an
// actual connection rather than called as a plain function. Everything else
// (room registry, presence, operation pipeline, fanout, eviction) has its
// own unit tests alongside the modules that implement it.

mod common;

mod health;
mod ingress;
mod socket;
