use carrot_rpc::amqp::{BrokerSettings, ConnectionFactory, RabbitMqSettings};
use carrot_rpc::codec::v1::{Bus, RangeItemsResponse, RouteDetailed, RoutePoint};
use carrot_rpc::rpc::{ClosureHandler, HandlerError, Incoming, RpcClient, RpcServer};
use carrot_rpc::Meta;

/// In a real service the context would hold a database pool: here we have a single route.
struct Context {
    route: RouteDetailed,
}

async fn detailed_routes(
    incoming: Incoming<Context>,
) -> Result<RangeItemsResponse<RouteDetailed>, HandlerError> {
    let bus: Bus = incoming.message.translate()?;
    let route = &incoming.context.route;
    if route.city != bus.city || route.bus != bus.num {
        return Err(HandlerError::not_found("route not found")
            .with_message(format!("no route for bus {} in {}", bus.num, bus.city)));
    }
    Ok(vec![route.clone()].into())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // The out-of-the-box parameters for the default RabbitMq Docker image.
    let connection_factory = ConnectionFactory::new_from_config(&RabbitMqSettings::default())?;
    // 30 pooled channels, 4 reply queues, 5 seconds per request, 3 seconds per publish.
    let settings = BrokerSettings::default();

    // The server side: it works on the `detailed-routes_rpc` queue, alongside any other
    // instance of the same service.
    let server = RpcServer::connect(&connection_factory, &settings).await?;
    let context = Context {
        route: RouteDetailed {
            city: "Minsk".into(),
            bus: "100".into(),
            points: vec![
                RoutePoint {
                    step: 1,
                    address: "Independence Avenue".into(),
                },
                RoutePoint {
                    step: 2,
                    address: "Victory Square".into(),
                },
            ],
        },
    };
    let dispatcher = server
        .listen_rpc_for_detailed_routes(ClosureHandler(detailed_routes), context)
        .await?
        // Leave once both requests below have been answered.
        .exit_after(2);
    let server_handle = tokio::spawn(dispatcher.run_until_sigterm());

    // The client side: each call borrows a reply queue, publishes the request and waits for the
    // reply carrying the same correlation id.
    let client = RpcClient::connect(&connection_factory, &settings).await?;
    for bus in [
        Bus {
            num: "100".into(),
            city: "Minsk".into(),
        },
        Bus {
            num: "7".into(),
            city: "Minsk".into(),
        },
    ] {
        let outcome = client
            .call::<_, RangeItemsResponse<RouteDetailed>>(&Meta::detailed_routes_rpc(), &bus)
            .await;
        match outcome {
            Ok(routes) => println!("bus {}: {} route(s) found", bus.num, routes.total),
            Err(e) => println!("bus {}: {}", bus.num, e),
        }
    }

    server_handle.await??;
    server.close().await?;
    Ok(())
}
