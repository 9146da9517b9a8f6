//! Integration test for the end-to-end signaling flow.

use chainline_core::harness::run_call_flow;

#[tokio::test]
async fn test_call_flow() {
    run_call_flow().await.expect("call flow should succeed");
}
