//! Basic usage of the resilience primitives

use resilience_machines::{
    AtomicRateLimiter, BulkheadConfig, CircuitBreaker, RateLimiterConfig, Retry,
    SemaphoreBulkhead, TimeLimiter, TimeLimiterConfig,
};
use std::time::Duration;

fn main() {
    println!("=== Circuit Breaker ===\n");

    let circuit = CircuitBreaker::builder("payment_api")
        .failure_rate_threshold(50.0)
        .count_based_window(4)
        .minimum_number_of_calls(4)
        .permitted_calls_in_half_open_state(2)
        .wait_duration_in_open_state(Duration::from_millis(200))
        .on_open(|name| println!("🔴 Circuit '{}' opened!", name))
        .on_close(|name| println!("🟢 Circuit '{}' closed!", name))
        .on_half_open(|name| println!("🟡 Circuit '{}' half-open, testing...", name))
        .build()
        .expect("valid circuit config");

    println!("Initial state: {}\n", circuit.state());

    println!("--- Successful calls ---");
    for i in 1..=2 {
        match circuit.call(move || Ok::<_, String>(format!("Payment {}", i))) {
            Ok(result) => println!("✓ {}", result),
            Err(e) => println!("✗ Error: {}", e),
        }
    }

    println!("--- Triggering failures ---");
    for i in 1..=2 {
        match circuit.call(move || Err::<String, _>(format!("Payment failed {}", i))) {
            Ok(_) => println!("✓ Success"),
            Err(e) => println!("✗ {}", e),
        }
    }
    let metrics = circuit.metrics();
    println!(
        "State: {} (failure rate {:.0}%)\n",
        circuit.state(),
        metrics.failure_rate
    );

    println!("--- Attempting call while open ---");
    match circuit.call(|| Ok::<_, String>("Should be rejected")) {
        Ok(_) => println!("✓ Success"),
        Err(e) => println!("✗ {}", e),
    }

    std::thread::sleep(Duration::from_millis(250));
    println!("\n--- Trial calls after the open wait ---");
    for _ in 0..2 {
        let _ = circuit.call(|| Ok::<_, String>("Payment successful"));
    }
    println!("State: {}\n", circuit.state());

    println!("=== Rate Limiter ===\n");
    let limiter = AtomicRateLimiter::new(
        "search",
        RateLimiterConfig {
            limit_for_period: 2,
            limit_refresh_period: Duration::from_millis(100),
            timeout_duration: Duration::ZERO,
        },
    )
    .expect("valid rate limiter config");
    for i in 1..=3 {
        println!("request {}: permitted = {}", i, limiter.try_acquire_permission());
    }
    println!(
        "waiting up to 150ms: permitted = {}\n",
        limiter.acquire_permission(Duration::from_millis(150))
    );

    println!("=== Bulkhead + Retry ===\n");
    let bulkhead = SemaphoreBulkhead::new(
        "inventory",
        BulkheadConfig {
            max_concurrent_calls: 1,
            ..Default::default()
        },
    )
    .expect("valid bulkhead config");
    let retry = Retry::builder("inventory")
        .max_attempts(3)
        .wait_duration(Duration::from_millis(20))
        .build()
        .expect("valid retry config");

    let mut attempts = 0;
    let result = retry.execute(|| {
        bulkhead.call(|| {
            attempts += 1;
            if attempts < 3 {
                Err(format!("attempt {} failed", attempts))
            } else {
                Ok("stock reserved")
            }
        })
    });
    println!("retry result: {:?} after {} attempts", result, attempts);
    println!("retry metrics: {:?}\n", retry.metrics());

    println!("=== Time Limiter ===\n");
    let time_limiter = TimeLimiter::new(
        "report",
        TimeLimiterConfig {
            timeout_duration: Duration::from_millis(50),
            cancel_running_future: true,
        },
    )
    .expect("valid time limiter config");
    let outcome = time_limiter.execute_blocking(|token| {
        token.sleep(Duration::from_secs(5)).map_err(|_| "cancelled")?;
        Ok::<_, &str>("report ready")
    });
    match outcome {
        Ok(report) => println!("✓ {}", report),
        Err(e) => println!("✗ {}", e),
    }
}
