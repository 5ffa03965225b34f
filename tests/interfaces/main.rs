//! Interface tests for the propagation chain using Cucumber.
//!
//! Scenarios run against the in-process broker and memory stores, so no
//! external services are required.
//!
//! ```bash
//! cargo test --test interfaces
//! ```

mod steps;

use cucumber::World;
use steps::delivery::DeliveryWorld;
use steps::materialization::MaterializationWorld;

#[tokio::main]
async fn main() {
    println!("\n=== Running Delivery Interface Tests ===\n");
    DeliveryWorld::cucumber()
        .fail_on_skipped()
        .run_and_exit("tests/interfaces/features/delivery.feature")
        .await;

    println!("\n=== Running Materialization Interface Tests ===\n");
    MaterializationWorld::cucumber()
        .fail_on_skipped()
        .run_and_exit("tests/interfaces/features/materialization.feature")
        .await;
}
