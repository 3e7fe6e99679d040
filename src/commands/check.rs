use async_nats::jetstream;
use async_nats::jetstream::consumer::pull;
use kube::Client;

pub async fn run(
    bus_url: &str,
    input_stream: &str,
    consumer: &str,
    output_stream: &str,
) -> anyhow::Result<()> {
    println!("Running connectivity checks...\n");

    // 1. Build Kubernetes client from kubeconfig
    print!("  Kubeconfig .................. ");
    let client = match Client::try_default().await {
        Ok(c) => {
            println!("OK");
            Some(c)
        }
        Err(e) => {
            println!("FAIL ({e})");
            None
        }
    };

    // 2. Verify actual cluster connectivity by fetching server version
    if let Some(client) = &client {
        print!("  Cluster connection .......... ");
        match client.apiserver_version().await {
            Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
            Err(e) => {
                println!("FAIL");
                println!("\n  Error: {}", e);
                println!("  Hint:  Is the cluster running? Check with: kubectl cluster-info\n");
            }
        }
    }

    // 3. Bus connection
    print!("  Bus connection .............. ");
    let nats = match async_nats::connect(bus_url).await {
        Ok(c) => {
            println!("OK ({bus_url})");
            c
        }
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach bus at {}: {}. Is the server running?", bus_url, e);
        }
    };

    let js = jetstream::new(nats);

    // 4. Input stream and shared durable consumer
    print!("  Input stream ................ ");
    match js.get_stream(input_stream).await {
        Ok(stream) => {
            println!("OK ({input_stream})");

            print!("  Durable consumer ............ ");
            match stream.get_consumer::<pull::Config>(consumer).await {
                Ok(_) => println!("OK ({consumer})"),
                Err(e) => println!("FAIL ({e})"),
            }
        }
        Err(e) => {
            println!("FAIL ({e})");
            println!("  Durable consumer ............ SKIPPED");
        }
    }

    // 5. Output stream
    print!("  Output stream ............... ");
    match js.get_stream(output_stream).await {
        Ok(_) => println!("OK ({output_stream})"),
        Err(e) => println!("FAIL ({e})"),
    }

    println!("\nAll checks completed.");
    Ok(())
}
