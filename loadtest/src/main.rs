use goose::prelude::*;
use rand::Rng;

/// Load testing suite for the image cache.
///
/// Traffic mix:
/// - Repeated transforms of the same image (cache hits, redirect or stream)
/// - Randomized transforms (cache misses, full render and store)
/// - Untransformed static files
/// - Health checks
///
/// The target's static root must contain `images/sample.jpg`.
///
/// # Usage
/// ```bash
/// cd loadtest
/// cargo run --release -- --host http://localhost:8080 --users 10 --hatch-rate 2 --run-time 60s
/// ```
///
/// # Performance Targets
/// - Cache hits: <20ms p95 latency
/// - Cache misses: <200ms p95 latency (WebP) / <400ms (AVIF)
/// - Error rate: <1%

const SAMPLE: &str = "/images/sample.jpg";

#[tokio::main]
async fn main() -> Result<(), GooseError> {
    GooseAttack::initialize()?
        .register_scenario(
            scenario!("ImageTransformation")
                .register_transaction(transaction!(transform_image).set_weight(10)?)
                .register_transaction(transaction!(static_file).set_weight(2)?)
                .register_transaction(transaction!(health_check).set_weight(1)?),
        )
        .register_scenario(
            scenario!("CachePerformance")
                .register_transaction(transaction!(cached_image).set_weight(15)?)
                .register_transaction(transaction!(uncached_image).set_weight(5)?),
        )
        .execute()
        .await?;

    Ok(())
}

/// Randomized dimensions and format spread requests over many cache keys.
async fn transform_image(user: &mut GooseUser) -> TransactionResult {
    // Generate random parameters before await to satisfy Send bounds
    let url = {
        let mut rng = rand::thread_rng();
        let formats = ["webp", "jpeg", "png", "avif"];
        format!(
            "{}?width={}&height={}&format={}&quality=80",
            SAMPLE,
            rng.gen_range(100..1000),
            rng.gen_range(100..1000),
            formats[rng.gen_range(0..formats.len())]
        )
    };

    let _goose = user.get(&url).await?;
    Ok(())
}

/// Fixed parameters hit the same artifact after the first request.
async fn cached_image(user: &mut GooseUser) -> TransactionResult {
    let _goose = user.get(&format!("{}?width=500&height=500&format=webp", SAMPLE)).await?;
    Ok(())
}

/// Wide random space so nearly every request renders.
async fn uncached_image(user: &mut GooseUser) -> TransactionResult {
    let url = {
        let mut rng = rand::thread_rng();
        format!(
            "{}?width={}&mode=crop&height={}",
            SAMPLE,
            rng.gen_range(16..4096),
            rng.gen_range(16..4096)
        )
    };

    let _goose = user.get(&url).await?;
    Ok(())
}

async fn static_file(user: &mut GooseUser) -> TransactionResult {
    let _goose = user.get(SAMPLE).await?;
    Ok(())
}

async fn health_check(user: &mut GooseUser) -> TransactionResult {
    let _goose = user.get("/health").await?;
    Ok(())
}
