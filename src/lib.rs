// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod channel;
pub mod company;
pub mod configs;
pub mod consumer;
pub mod dispatcher;
pub mod envelope;
pub mod errors;
pub mod events;
pub mod exchange;
pub mod handler;
pub mod health;
pub mod publisher;
pub mod queue;
pub mod reconnect;
pub mod subscriber;
pub mod topology;
