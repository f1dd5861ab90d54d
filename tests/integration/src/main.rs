//! Integration Test Harness
//!
//! Runs every integration test category and prints a summary.
//!
//! # Usage
//!
//! Run all tests:
//! ```text
//! cargo run -p integration-tests
//! ```
//!
//! Run specific test categories:
//! ```text
//! cargo test -p integration-tests --test proxy_tests
//! cargo test -p integration-tests --test cast_tests
//! cargo test -p integration-tests --test twoway_tests
//! cargo test -p integration-tests --test ami_tests
//! cargo test -p integration-tests --test batch_tests
//! cargo test -p integration-tests --test connection_tests
//! cargo test -p integration-tests --test collocation_tests
//! ```
//!
//! Run with increased logging:
//! ```text
//! RUST_LOG=objrpc=debug cargo run -p integration-tests
//! ```

use std::process::Command;
use std::time::{Duration, Instant};

/// Test category
#[derive(Debug, Clone)]
struct TestCategory {
    name: &'static str,
    description: &'static str,
    test_name: &'static str,
}

const TEST_CATEGORIES: &[TestCategory] = &[
    TestCategory {
        name: "Proxy Tests",
        description: "Reference parsing, printing and proxy mutators",
        test_name: "proxy_tests",
    },
    TestCategory {
        name: "Cast Tests",
        description: "Checked and unchecked casts, contexts on ice_isA",
        test_name: "cast_tests",
    },
    TestCategory {
        name: "Twoway Tests",
        description: "Request/reply, timeouts, concurrent callers",
        test_name: "twoway_tests",
    },
    TestCategory {
        name: "AMI Tests",
        description: "Asynchronous invocation, callbacks, blocking calls",
        test_name: "ami_tests",
    },
    TestCategory {
        name: "Batch Tests",
        description: "Oneway, datagram and batched requests",
        test_name: "batch_tests",
    },
    TestCategory {
        name: "Connection Tests",
        description: "Connection loss, endpoint selection, locators",
        test_name: "connection_tests",
    },
    TestCategory {
        name: "Collocation Tests",
        description: "In-process dispatch to local adapters",
        test_name: "collocation_tests",
    },
];

struct CategoryResult {
    name: &'static str,
    success: bool,
    duration: Duration,
    summary: String,
}

fn print_banner() {
    println!(
        r#"
================================================================================
              ___  _     _ ____  ____   ____
             / _ \| |__ (_)  _ \|  _ \ / ___|
            | | | | '_ \| | |_) | |_) | |
            | |_| | |_) | |  _ <|  __/| |___
             \___/|_.__// |_| \_\_|    \____|
                      |__/
                    Integration Test Suite
================================================================================
"#
    );
}

fn print_test_categories() {
    println!("Test Categories:");
    println!("{}", "-".repeat(80));
    for (i, cat) in TEST_CATEGORIES.iter().enumerate() {
        println!("  {}. {} - {}", i + 1, cat.name, cat.description);
    }
    println!("{}", "-".repeat(80));
    println!();
}

fn run_test_category(category: &TestCategory) -> CategoryResult {
    println!("\n{}", "=".repeat(80));
    println!("Running: {}", category.name);
    println!("{}", "=".repeat(80));

    let start = Instant::now();
    let output = Command::new("cargo")
        .args([
            "test",
            "-p",
            "integration-tests",
            "--test",
            category.test_name,
            "--",
            "--nocapture",
        ])
        .output();
    let duration = start.elapsed();

    let (success, summary) = match output {
        Ok(output) => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stdout.is_empty() {
                println!("{}", stdout);
            }
            if !stderr.is_empty() {
                eprintln!("{}", stderr);
            }

            if output.status.success() {
                (true, "PASSED".to_string())
            } else {
                (false, format!("FAILED (exit code: {:?})", output.status.code()))
            }
        }
        Err(e) => (false, format!("Failed to execute: {}", e)),
    };

    CategoryResult {
        name: category.name,
        success,
        duration,
        summary,
    }
}

fn main() {
    print_banner();
    print_test_categories();

    println!("Starting integration test suite...\n");

    let total_start = Instant::now();
    let results: Vec<CategoryResult> = TEST_CATEGORIES.iter().map(run_test_category).collect();
    let total_duration = total_start.elapsed();

    println!("\n{}", "=".repeat(80));
    println!("FINAL SUMMARY");
    println!("{}", "=".repeat(80));

    let passed = results.iter().filter(|r| r.success).count();
    let failed = results.len() - passed;

    println!(
        "\nCategories: {} | Passed: {} | Failed: {}",
        results.len(),
        passed,
        failed
    );
    println!("Total Duration: {:?}", total_duration);
    println!();

    println!("{:<30} {:<10} {:<15} Details", "Category", "Status", "Duration");
    println!("{}", "-".repeat(80));
    for result in &results {
        let status = if result.success { "PASS" } else { "FAIL" };
        println!(
            "{:<30} {:<10} {:<15} {}",
            result.name,
            status,
            format!("{:.2?}", result.duration),
            result.summary
        );
    }
    println!("{}", "=".repeat(80));

    if failed > 0 {
        println!("\nSome tests failed!");
        std::process::exit(1);
    }
    println!("\nAll tests passed!");
}
