// Copyright 2019 Conflux Foundation. All rights reserved.
// Conflux is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

mod onroad;

pub use onroad::{OnRoadInfo, OnRoadMeta, OnRoadPlugin, Pending};
