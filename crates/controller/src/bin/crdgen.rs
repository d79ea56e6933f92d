/*
 * Kindling - CRD Generator
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Prints both CustomResourceDefinitions as a multi-document YAML stream

use kindling_controller::{DevStagingEnvironment, GithubActionRunnerPool};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let documents = [
        serde_yaml::to_string(&DevStagingEnvironment::crd())?,
        serde_yaml::to_string(&GithubActionRunnerPool::crd())?,
    ];
    for document in documents {
        println!("---");
        print!("{document}");
    }
    Ok(())
}
