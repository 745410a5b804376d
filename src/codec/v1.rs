//! Version 1 of the bus-routes message models.
use serde::{Deserialize, Serialize};

/// A bus, identified by its number within a city.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bus {
    pub num: String,
    pub city: String,
}

/// A stop along a route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutePoint {
    pub step: i8,
    pub address: String,
}

/// The detailed view of a route: city, bus number and ordered stops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDetailed {
    pub city: String,
    pub bus: String,
    pub points: Vec<RoutePoint>,
}

/// A page of items together with the total count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeItemsResponse<T> {
    pub items: Vec<T>,
    pub total: i64,
}

impl<T> From<Vec<T>> for RangeItemsResponse<T> {
    fn from(items: Vec<T>) -> Self {
        let total = items.len() as i64;
        Self { items, total }
    }
}
