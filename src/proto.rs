//! Generated gRPC and state-file types for the `portal.v1` package.

tonic::include_proto!("portal.v1");
