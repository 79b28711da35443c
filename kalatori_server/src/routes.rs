//! Request handler definitions
//!
//! Define each route and its handler here. Handlers only translate between HTTP and the engine; anything more than a
//! few lines belongs in the engine.
//!
//! Since each worker thread processes its requests sequentially, handlers must never block the current thread. All
//! engine calls are async.
use actix_web::{get, web, HttpResponse, Responder};
use kalatori_engine::{
    db_types::{Order, OrderId},
    ChainClient,
    HealthBoard,
    OrderRequest,
    OrderStore,
    ReconciliationEngine,
};
use log::*;

use crate::{
    config::ServerOptions,
    data_objects::{OrderResponse, StatusResponse},
    errors::ServerError,
};

// Web-actix cannot handle generics in handlers, so it's implemented manually using the `route!` macro
#[macro_export]
macro_rules! route {
    ($name:ident => $method:ident $path:literal impl $($bounds:ty),+) => {
        paste::paste! { pub struct [<$name:camel Route>]< $( [< T $bounds:camel> ],)+ >( $( core::marker::PhantomData<fn() -> [< T $bounds:camel> ] >,)+ );}
        paste::paste! { impl< $( [< T $bounds:camel> ],)+ > [<$name:camel Route>]< $( [< T $bounds:camel> ],)+ > {
            #[allow(clippy::new_without_default)]
            pub fn new() -> Self {
                Self($( core::marker::PhantomData::<fn() -> [< T $bounds:camel> ] >,)+)
            }
        }}
        paste::paste! { impl<$( [< T $bounds:camel >] , )+> actix_web::dev::HttpServiceFactory for [<$name:camel Route>]<$([<T $bounds:camel>],)+>
        where
            $([<T $bounds:camel>]: $bounds + 'static,)+
        {
            fn register(self, config: &mut actix_web::dev::AppService) {
                let res = actix_web::Resource::new($path)
                    .name(stringify!($name))
                    .guard(actix_web::guard::$method())
                    .to($name::< $( [< T $bounds:camel >], )+>);
                actix_web::dev::HttpServiceFactory::register(res, config);
            }
        }}
    };
}

fn order_response<B: OrderStore, C: ChainClient>(
    order: Order,
    engine: &ReconciliationEngine<B, C>,
    options: &ServerOptions,
) -> Result<OrderResponse, ServerError> {
    let currency = engine.registry().get(&order.currency).ok_or_else(|| {
        let msg = format!("Order {} is in {}, which is no longer configured", order.order_id, order.currency);
        ServerError::BackendError(msg)
    })?;
    Ok(OrderResponse::new(order, currency, engine.registry(), &options.server_info))
}

// ----------------------------------------------   Health  ----------------------------------------------------
#[get("/health")]
pub async fn health(board: web::Data<HealthBoard>) -> impl Responder {
    trace!("💻️ Received health check request");
    if board.is_healthy() {
        HttpResponse::Ok().body("👍️\n")
    } else {
        HttpResponse::ServiceUnavailable().json(board.snapshot())
    }
}

// ----------------------------------------------   Status  ----------------------------------------------------
route!(status => Get "/v2/status" impl OrderStore, ChainClient);
/// Service metadata, the supported currencies (keyed by symbol) and the health of every chain watcher.
pub async fn status<B: OrderStore, C: ChainClient>(
    engine: web::Data<ReconciliationEngine<B, C>>,
    options: web::Data<ServerOptions>,
    board: web::Data<HealthBoard>,
) -> Result<HttpResponse, ServerError> {
    trace!("💻️ GET status");
    let status = StatusResponse {
        description: options.description.clone(),
        server_info: options.server_info.clone(),
        supported_currencies: engine.registry().currencies().clone(),
        chains: board.snapshot(),
    };
    Ok(HttpResponse::Ok().json(status))
}

// ----------------------------------------------   Orders  ----------------------------------------------------
route!(order => Post "/v2/order/{order_id}" impl OrderStore, ChainClient);
/// Creates or reads an order.
///
/// With a JSON body (`{amount, currency, callback}`) the order is created, and `201 Created` is returned. If the
/// order already exists with the same parameters, it is returned with `200 OK`; with different parameters the request
/// fails with `409 Conflict`.
///
/// With an empty body, the current state of the order is returned, or `404` if it does not exist.
pub async fn order<B: OrderStore, C: ChainClient>(
    path: web::Path<String>,
    body: web::Bytes,
    engine: web::Data<ReconciliationEngine<B, C>>,
    options: web::Data<ServerOptions>,
) -> Result<HttpResponse, ServerError> {
    let order_id = OrderId::from(path.into_inner());
    if body.iter().all(u8::is_ascii_whitespace) {
        debug!("💻️ GET order {order_id}");
        let order = engine.fetch_order(&order_id).await?;
        return Ok(HttpResponse::Ok().json(order_response(order, engine.get_ref(), &options)?));
    }
    let request = serde_json::from_slice::<OrderRequest>(&body).map_err(|e| {
        debug!("💻️ Could not parse the order request for {order_id}. {e}");
        ServerError::InvalidRequestBody(e.to_string())
    })?;
    debug!("💻️ Create order {order_id} for {} {}", request.amount, request.currency);
    let creation = engine.create_order(order_id, request).await?;
    let is_new = creation.is_new();
    let response = order_response(creation.into_order(), engine.get_ref(), &options)?;
    if is_new {
        Ok(HttpResponse::Created().json(response))
    } else {
        Ok(HttpResponse::Ok().json(response))
    }
}

route!(force_withdrawal => Post "/v2/order/{order_id}/forceWithdrawal" impl OrderStore, ChainClient);
/// Retries the withdrawal of a paid order and returns the order as it stands afterwards.
pub async fn force_withdrawal<B: OrderStore, C: ChainClient>(
    path: web::Path<String>,
    engine: web::Data<ReconciliationEngine<B, C>>,
    options: web::Data<ServerOptions>,
) -> Result<HttpResponse, ServerError> {
    let order_id = OrderId::from(path.into_inner());
    info!("💻️ Forced withdrawal requested for order {order_id}");
    let order = engine.force_withdrawal(&order_id).await?;
    Ok(HttpResponse::Ok().json(order_response(order, engine.get_ref(), &options)?))
}
